//! Encrypted stream adapter used by the metadata codec.
//!
//! [`StreamCipher`] seals a plaintext buffer into a chunked container and opens
//! it again. [`CipherReader`] and [`CipherWriter`] expose that container as
//! tokio I/O so the codec never sees ciphertext.
//!
//! ## Container Format
//!
//! ```text
//! [format_version:1][chunk1][chunk2]...
//!
//! Each chunk:
//! [nonce:24][final:1][length:4][encrypted_data]
//! ```
//!
//! Every chunk is authenticated with `label || final || chunk_index` as
//! associated data. Dropping, reordering or appending chunks therefore fails
//! to open.

use chacha20poly1305::aead::{Aead, AeadCore, OsRng, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use std::io::{self, Cursor, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{
    AsyncBufRead, AsyncRead, AsyncReadExt, AsyncSeek, AsyncWrite, AsyncWriteExt, ReadBuf,
};
use zeroize::{Zeroize, Zeroizing};

use crate::error::CipherError;

/// Plaintext bytes per chunk (64KB)
const CHUNK_SIZE: usize = 64 * 1024;

/// Poly1305 tag appended to every chunk
const TAG_SIZE: usize = 16;

const NONCE_SIZE: usize = 24;

/// Container format version
pub const FORMAT_VERSION: u8 = 1;

/// A readable, seekable stream that must be closed explicitly.
pub trait ReadSeekClose: AsyncRead + AsyncSeek + Unpin {
    /// Release the stream. Closing twice is an error.
    fn close(&mut self) -> Result<(), CipherError>;
}

impl<T: ReadSeekClose + ?Sized> ReadSeekClose for &mut T {
    fn close(&mut self) -> Result<(), CipherError> {
        (**self).close()
    }
}

#[derive(Clone)]
pub struct StreamCipher {
    cipher: XChaCha20Poly1305,
}

impl StreamCipher {
    pub fn new(cipher: XChaCha20Poly1305) -> Self {
        Self { cipher }
    }

    /// Seals `plaintext` into `writer`. An empty plaintext still produces a
    /// single (empty) final chunk. Returns the number of plaintext bytes sealed.
    pub async fn seal<W>(
        &self,
        plaintext: &[u8],
        writer: &mut W,
        label: &[u8],
    ) -> Result<u64, CipherError>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_u8(FORMAT_VERSION).await?;

        let mut chunks = plaintext.chunks(CHUNK_SIZE).peekable();
        let mut index = 0u64;

        loop {
            let chunk = chunks.next().unwrap_or(&[]);
            let last = chunks.peek().is_none();

            let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
            let aad = chunk_aad(label, last, index);
            let ciphertext = self
                .cipher
                .encrypt(
                    &nonce,
                    Payload {
                        msg: chunk,
                        aad: &aad,
                    },
                )
                .map_err(|e| CipherError::encryption(format!("chunk {}: {}", index, e)))?;

            writer.write_all(&nonce).await?;
            writer.write_u8(u8::from(last)).await?;
            writer.write_u32(ciphertext.len() as u32).await?;
            writer.write_all(&ciphertext).await?;

            if last {
                break;
            }
            index += 1;
        }

        writer.flush().await?;
        Ok(plaintext.len() as u64)
    }

    /// Opens a container produced by [`seal`](Self::seal), authenticating
    /// every chunk and the container's end.
    pub async fn open<R>(
        &self,
        reader: &mut R,
        label: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CipherError>
    where
        R: AsyncRead + Unpin,
    {
        let version = match reader.read_u8().await {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(CipherError::format("empty stream"));
            }
            Err(e) => return Err(e.into()),
        };
        if version != FORMAT_VERSION {
            return Err(CipherError::format(format!(
                "unsupported container version: {}",
                version
            )));
        }

        let mut plaintext = Zeroizing::new(Vec::new());
        let mut nonce_buf = [0u8; NONCE_SIZE];
        let mut index = 0u64;

        loop {
            reader.read_exact(&mut nonce_buf).await.map_err(truncated)?;

            let last = match reader.read_u8().await.map_err(truncated)? {
                0 => false,
                1 => true,
                other => {
                    return Err(CipherError::format(format!(
                        "bad final flag {} on chunk {}",
                        other, index
                    )));
                }
            };

            let chunk_len = reader.read_u32().await.map_err(truncated)? as usize;
            if chunk_len > CHUNK_SIZE + TAG_SIZE {
                return Err(CipherError::format(format!(
                    "chunk {} too large ({} bytes)",
                    index, chunk_len
                )));
            }

            let mut ciphertext = vec![0u8; chunk_len];
            reader.read_exact(&mut ciphertext).await.map_err(truncated)?;

            #[allow(deprecated)]
            let nonce = XNonce::from_slice(&nonce_buf);
            let aad = chunk_aad(label, last, index);
            let chunk = Zeroizing::new(
                self.cipher
                    .decrypt(
                        nonce,
                        Payload {
                            msg: &ciphertext,
                            aad: &aad,
                        },
                    )
                    .map_err(|_| {
                        CipherError::decryption(format!("chunk {} failed authentication", index))
                    })?,
            );
            plaintext.extend_from_slice(&chunk);

            if last {
                let mut probe = [0u8; 1];
                if reader.read(&mut probe).await? != 0 {
                    return Err(CipherError::format("trailing data after final chunk"));
                }
                return Ok(plaintext);
            }
            index += 1;
        }
    }
}

fn chunk_aad(label: &[u8], last: bool, index: u64) -> Vec<u8> {
    let mut aad = Vec::with_capacity(label.len() + 9);
    aad.extend_from_slice(label);
    aad.push(u8::from(last));
    aad.extend_from_slice(&index.to_be_bytes());
    aad
}

fn truncated(err: io::Error) -> CipherError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        CipherError::format("stream truncated before final chunk")
    } else {
        CipherError::Io(err)
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "stream already closed")
}

/// Decrypted view over a sealed container.
///
/// The whole container is authenticated up front by [`open`](Self::open);
/// reads and seeks then run over zeroize-on-close memory.
pub struct CipherReader {
    plaintext: Cursor<Vec<u8>>,
    closed: bool,
}

impl CipherReader {
    pub async fn open<R>(
        cipher: &StreamCipher,
        reader: &mut R,
        label: &[u8],
    ) -> Result<Self, CipherError>
    where
        R: AsyncRead + Unpin,
    {
        let mut plaintext = cipher.open(reader, label).await?;
        Ok(Self {
            plaintext: Cursor::new(std::mem::take(&mut *plaintext)),
            closed: false,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl ReadSeekClose for CipherReader {
    fn close(&mut self) -> Result<(), CipherError> {
        if self.closed {
            return Err(CipherError::Closed);
        }
        self.plaintext.get_mut().zeroize();
        self.plaintext.set_position(0);
        self.closed = true;
        Ok(())
    }
}

impl Drop for CipherReader {
    fn drop(&mut self) {
        self.plaintext.get_mut().zeroize();
    }
}

impl AsyncRead for CipherReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.plaintext).poll_read(cx, buf)
    }
}

impl AsyncBufRead for CipherReader {
    fn poll_fill_buf(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<&[u8]>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(closed_error()));
        }
        Pin::new(&mut this.plaintext).poll_fill_buf(cx)
    }

    fn consume(self: Pin<&mut Self>, amt: usize) {
        Pin::new(&mut self.get_mut().plaintext).consume(amt)
    }
}

impl AsyncSeek for CipherReader {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        if this.closed {
            return Err(closed_error());
        }
        Pin::new(&mut this.plaintext).start_seek(position)
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Pin::new(&mut self.get_mut().plaintext).poll_complete(cx)
    }
}

/// Buffers plaintext and seals it into `inner` on [`close`](Self::close).
///
/// Flushing does not seal, so any number of sections can be written before
/// the single close.
pub struct CipherWriter<W> {
    inner: W,
    cipher: StreamCipher,
    label: Vec<u8>,
    plaintext: Zeroizing<Vec<u8>>,
}

impl<W> CipherWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(cipher: StreamCipher, inner: W, label: impl Into<Vec<u8>>) -> Self {
        Self {
            inner,
            cipher,
            label: label.into(),
            plaintext: Zeroizing::new(Vec::new()),
        }
    }

    /// Plaintext bytes written so far.
    pub fn buffered_len(&self) -> usize {
        self.plaintext.len()
    }

    /// Seal everything written so far and hand back the inner writer.
    pub async fn close(self) -> Result<W, CipherError> {
        let CipherWriter {
            mut inner,
            cipher,
            label,
            plaintext,
        } = self;

        cipher.seal(&plaintext, &mut inner, &label).await?;
        inner.flush().await?;
        Ok(inner)
    }
}

impl<W: Unpin> AsyncWrite for CipherWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().plaintext.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
