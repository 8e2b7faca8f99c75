//! Range-hash verification against the remote copy of an object.

use std::io::SeekFrom;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};
use tracing::{debug, warn};

use crate::error::{ObjnetError, Result};
use crate::object::Range;
use crate::refs::Address;
use crate::rpc::{GetRangeHashRequest, GetRangeHashResponse};
use crate::transfer::UploadReceipt;
use crate::transport::ObjectService;
use crate::tz::{Accumulator, Digest};

const READ_BLOCK: usize = 64 * 1024;

/// Remote digest of one range and, when a local source was given, whether
/// the local bytes hash to the same value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeCheck {
    pub range: Range,
    pub digest: Digest,
    pub matches_local: Option<bool>,
}

/// Ask the service for one digest per range. The answer is matched to the
/// request by position, so any count mismatch is fatal.
pub async fn range_hashes<S>(
    service: &S,
    address: Address,
    ranges: &[Range],
    salt: &[u8],
    ttl: u32,
) -> Result<Vec<Digest>>
where
    S: ObjectService + ?Sized,
{
    let GetRangeHashResponse { hashes } = service
        .get_range_hash(GetRangeHashRequest {
            address,
            ranges: ranges.to_vec(),
            salt: salt.to_vec(),
            ttl,
        })
        .await?;
    if hashes.len() != ranges.len() {
        return Err(ObjnetError::integrity(format!(
            "requested {} range hashes, received {}",
            ranges.len(),
            hashes.len()
        )));
    }
    Ok(hashes)
}

/// Digest of `range` read from `source`, salted the way the service salts
/// it. `None` when the source ends inside the range.
pub async fn local_digest<R>(source: &mut R, range: Range, salt: &[u8]) -> Result<Option<Digest>>
where
    R: AsyncRead + AsyncSeek + Unpin + ?Sized,
{
    source.seek(SeekFrom::Start(range.offset)).await?;
    let mut acc = Accumulator::new();
    let mut buf = vec![0u8; READ_BLOCK];
    while acc.absorbed() < range.length {
        let want = (range.length - acc.absorbed()).min(READ_BLOCK as u64) as usize;
        let n = source.read(&mut buf[..want]).await?;
        if n == 0 {
            return Ok(None);
        }
        let block = &mut buf[..n];
        if !salt.is_empty() {
            let start = (acc.absorbed() % salt.len() as u64) as usize;
            for (b, s) in block.iter_mut().zip(salt.iter().cycle().skip(start)) {
                *b ^= s;
            }
        }
        acc.absorb(block);
    }
    Ok(Some(acc.finalize()))
}

/// Request salted digests for `ranges` and compare each with the matching
/// local range when `local` is given.
pub async fn verify_ranges<S, R>(
    service: &S,
    address: Address,
    ranges: &[Range],
    salt: &[u8],
    ttl: u32,
    mut local: Option<&mut R>,
) -> Result<Vec<RangeCheck>>
where
    S: ObjectService + ?Sized,
    R: AsyncRead + AsyncSeek + Unpin + ?Sized,
{
    let hashes = range_hashes(service, address, ranges, salt, ttl).await?;
    let mut checks = Vec::with_capacity(ranges.len());
    for (range, digest) in ranges.iter().zip(hashes) {
        let matches_local = match local.as_deref_mut() {
            Some(source) => {
                let ok = local_digest(source, *range, salt).await? == Some(digest);
                if !ok {
                    warn!(%address, %range, "range hash mismatch");
                }
                Some(ok)
            }
            None => None,
        };
        checks.push(RangeCheck {
            range: *range,
            digest,
            matches_local,
        });
    }
    Ok(checks)
}

/// Compare the running digest of an upload with the service's digest over
/// the whole stored payload.
pub async fn verify_upload<S>(service: &S, receipt: &UploadReceipt, ttl: u32) -> Result<bool>
where
    S: ObjectService + ?Sized,
{
    let full = [Range::new(0, receipt.bytes)];
    let hashes = range_hashes(service, receipt.address, &full, &[], ttl).await?;
    let ok = hashes[0] == receipt.digest;
    debug!(address = %receipt.address, ok, "upload verified");
    Ok(ok)
}
