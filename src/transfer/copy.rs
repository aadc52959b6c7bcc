//! Stream copy for transfers fed by a byte stream instead of ranged I/O

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Transfer, WriteLimit};
use crate::error::{Result, SftpdError};

pub const COPY_BUFFER_SIZE: usize = 32 * 1024;

impl Transfer {
    /// Pump `src` into `dst` until EOF, accounting bytes on this transfer.
    ///
    /// The write limit applies to the total copied. Any error is also
    /// recorded as the transfer error.
    pub async fn copy_from_reader_to_writer<W, R>(&self, dst: &mut W, src: &mut R) -> Result<u64>
    where
        W: AsyncWrite + Unpin + ?Sized,
        R: AsyncRead + Unpin + ?Sized,
    {
        let limit = self.max_write_size;
        if limit == WriteLimit::Exceeded {
            self.transfer_error(SftpdError::QuotaExceeded);
            return Err(SftpdError::QuotaExceeded);
        }

        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut written: u64 = 0;
        let result = loop {
            let nr = match src.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(SftpdError::from(e)),
            };
            let mut pos = 0;
            let mut chunk_error = None;
            while pos < nr {
                match dst.write(&buf[pos..nr]).await {
                    Ok(0) => {
                        chunk_error = Some(SftpdError::ShortWrite);
                        break;
                    }
                    Ok(n) => {
                        pos += n;
                        written += n as u64;
                        self.connection.update_last_activity();
                        self.add_transferred(n as u64);
                    }
                    Err(e) => {
                        chunk_error = Some(SftpdError::from(e));
                        break;
                    }
                }
            }
            if let Some(err) = chunk_error {
                break Err(err);
            }
            if limit.is_exceeded_by(written) {
                break Err(SftpdError::QuotaExceeded);
            }
        };

        let result = match result {
            Ok(()) => dst.flush().await.map_err(SftpdError::from),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => Ok(written),
            Err(err) => {
                self.transfer_error(err.clone());
                Err(err)
            }
        }
    }
}
