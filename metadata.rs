//! Read and write metadata sections.
//!
//! A section is a header line followed by exactly `count` records, one JSON
//! object per line:
//!
//! ```text
//! {"count":2,"version":7}
//! {"id":1,"name":"alice"}
//! {"id":2,"name":"bob"}
//! ```
//!
//! Several sections may share one stream. The shared-scanner reader
//! ([`read_section_with_lines`]) parses one section and leaves the cursor on
//! the next; [`write_section`] never closes its writer so sections can be
//! appended back to back.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::Hash;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, Lines,
};
use tracing::{debug, warn};

use crate::cipherio::ReadSeekClose;
use crate::error::MetadataError;

/// A record that can live in a metadata section, keyed by its own id.
pub trait Record: Serialize + DeserializeOwned {
    type Id: Eq + Hash;

    /// Section name used in errors and logs.
    const KIND: &'static str;

    fn id(&self) -> Self::Id;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct SectionHeader {
    count: usize,
    version: i64,
}

/// Read one section into `records`, returning its version.
/// `records` is not cleared; entries from the stream overwrite colliding ids.
/// The reader is always closed. A parse error wins over a close error.
pub async fn read_section<T, R>(
    records: &mut HashMap<T::Id, T>,
    mut reader: R,
) -> Result<i64, MetadataError>
where
    T: Record,
    R: ReadSeekClose,
{
    let result = {
        let mut lines = BufReader::new(&mut reader).lines();
        read_section_with_lines(records, &mut lines).await
    };
    let closed = reader.close();

    match result {
        Ok(version) => {
            closed.map_err(MetadataError::Close)?;
            Ok(version)
        }
        Err(err) => {
            if let Err(close_err) = closed {
                warn!(kind = T::KIND, error = %close_err, "close failed after section read error");
            }
            Err(err)
        }
    }
}

/// Same as [`read_section`], but reads from a line cursor owned by someone
/// else and closes nothing.
pub async fn read_section_with_lines<T, R>(
    records: &mut HashMap<T::Id, T>,
    lines: &mut Lines<R>,
) -> Result<i64, MetadataError>
where
    T: Record,
    R: AsyncBufRead + Unpin,
{
    let header = read_header::<R>(T::KIND, lines).await?;

    for index in 0..header.count {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                return Err(MetadataError::Truncated {
                    kind: T::KIND,
                    read: index,
                    expected: header.count,
                });
            }
            Err(source) => {
                return Err(MetadataError::Scan {
                    kind: T::KIND,
                    index,
                    source,
                });
            }
        };

        let entry: T = match serde_json::from_str(&line) {
            Ok(entry) => entry,
            Err(source) => {
                return Err(MetadataError::MalformedRecord {
                    kind: T::KIND,
                    index,
                    raw: line,
                    source,
                });
            }
        };

        records.insert(entry.id(), entry);
    }

    debug!(
        kind = T::KIND,
        count = header.count,
        version = header.version,
        "read metadata section"
    );
    Ok(header.version)
}

async fn read_header<R>(
    kind: &'static str,
    lines: &mut Lines<R>,
) -> Result<SectionHeader, MetadataError>
where
    R: AsyncBufRead + Unpin,
{
    let line = lines
        .next_line()
        .await
        .map_err(|source| MetadataError::Io { kind, source })?
        .ok_or(MetadataError::MissingHeader { kind })?;

    serde_json::from_str(&line).map_err(|source| MetadataError::MalformedHeader {
        kind,
        raw: line,
        source,
    })
}

/// Write `records` as one section stamped with `version`.
/// Output is buffered and flushed once; the writer is not closed.
pub async fn write_section<T, W>(
    records: &HashMap<T::Id, T>,
    version: i64,
    writer: &mut W,
) -> Result<(), MetadataError>
where
    T: Record,
    W: AsyncWrite + Unpin,
{
    let kind = T::KIND;
    let mut out = BufWriter::new(writer);

    let header = SectionHeader {
        count: records.len(),
        version,
    };
    let mut line = serde_json::to_vec(&header)
        .map_err(|source| MetadataError::EncodeHeader { kind, source })?;
    line.push(b'\n');
    out.write_all(&line)
        .await
        .map_err(|source| MetadataError::WriteHeader { kind, source })?;

    for (index, entry) in records.values().enumerate() {
        let mut line = serde_json::to_vec(entry)
            .map_err(|source| MetadataError::Encode { kind, index, source })?;
        line.push(b'\n');

        out.write_all(&line)
            .await
            .map_err(|source| MetadataError::Write { kind, index, source })?;
    }

    out.flush()
        .await
        .map_err(|source| MetadataError::Flush { kind, source })?;

    debug!(kind, count = records.len(), version, "wrote metadata section");
    Ok(())
}
