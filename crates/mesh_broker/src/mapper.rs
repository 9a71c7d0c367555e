//! Deterministic channel-to-peer mapping.
//!
//! Every node in the cluster must resolve a channel name to the same peer
//! given the same ordered peer list, so the hash below is part of the wire
//! protocol and cannot change.

use crate::error::RelayError;

/// Maps a channel name onto one peer URI from an ordered peer list.
///
/// Implementations must be pure: identical inputs always produce the
/// identical peer. Returns `None` only for an empty peer list.
pub trait ChannelMapper: Send + Sync {
    fn target<'a>(&self, channel: &str, peers: &'a [String]) -> Option<&'a str>;
}

/// The protocol's shard mapper.
///
/// Computes a 32-bit signed rolling hash over the channel name's UTF-16
/// code units, `h = ((h << 5) - h + u) | 0` starting from `h = 0`, then
/// indexes the peer list with `abs(h) % peers.len()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShardMapper;

impl ChannelMapper for ShardMapper {
    fn target<'a>(&self, channel: &str, peers: &'a [String]) -> Option<&'a str> {
        if peers.is_empty() {
            return None;
        }
        let index = channel_hash(channel).unsigned_abs() as usize % peers.len();
        Some(peers[index].as_str())
    }
}

/// Resolve a channel against a peer list, failing fast on empty input.
pub fn map_channel<'a>(channel: &str, peers: &'a [String]) -> Result<&'a str, RelayError> {
    ShardMapper
        .target(channel, peers)
        .ok_or(RelayError::EmptyPeerList)
}

/// The rolling 32-bit hash over UTF-16 code units.
fn channel_hash(channel: &str) -> i32 {
    let mut h: i32 = 0;
    for unit in channel.encode_utf16() {
        h = h
            .wrapping_shl(5)
            .wrapping_sub(h)
            .wrapping_add(i32::from(unit));
    }
    h
}
