//! The narrow surface a host audio server exposes to a device pair.

use std::fmt;

use bytes::Bytes;

use crate::audio::SampleEncoding;
use crate::error::{BridgeError, Result};

/// Channel position names accepted in a channel map, besides `auxN`.
const POSITIONS: &[&str] = &[
    "mono",
    "front-left",
    "front-right",
    "front-center",
    "rear-center",
    "rear-left",
    "rear-right",
    "lfe",
    "front-left-of-center",
    "front-right-of-center",
    "side-left",
    "side-right",
    "top-center",
    "top-front-left",
    "top-front-right",
    "top-front-center",
    "top-rear-left",
    "top-rear-right",
    "top-rear-center",
];

/// Upper bound of the `auxN` positions.
const MAX_AUX: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Applications play into it; audio flows towards the lambda
    Sink,
    /// Applications record from it; audio comes back from the lambda
    Source,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sink => f.write_str("sink"),
            Self::Source => f.write_str("source"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleSpec {
    pub encoding: SampleEncoding,
    pub rate: u32,
    pub channels: u32,
}

impl SampleSpec {
    pub fn bytes_per_frame(&self) -> usize {
        (self.encoding.bytes_per_sample() * self.channels) as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMap(Vec<String>);

impl ChannelMap {
    /// Parse a comma separated list of position names.
    pub fn parse(list: &str) -> Result<Self> {
        let positions = list
            .split(',')
            .map(|name| {
                let name = name.trim();
                canonical_position(name)
                    .ok_or_else(|| BridgeError::ModuleArgs(format!("unknown channel position '{}'", name)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self(positions))
    }

    /// Map used when only a channel count is known.
    pub fn default_for(channels: u32) -> Self {
        let positions: Vec<String> = match channels {
            1 => vec!["mono".into()],
            2 => vec!["front-left".into(), "front-right".into()],
            n => (0..n).map(|i| format!("aux{}", i)).collect(),
        };
        Self(positions)
    }

    pub fn channels(&self) -> u32 {
        self.0.len() as u32
    }

    pub fn positions(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for ChannelMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(","))
    }
}

fn canonical_position(name: &str) -> Option<String> {
    let name = name.to_ascii_lowercase();
    let alias = match name.as_str() {
        "left" => "front-left",
        "right" => "front-right",
        "center" => "front-center",
        "subwoofer" => "lfe",
        other => other,
    };
    if POSITIONS.contains(&alias) {
        return Some(alias.to_string());
    }
    let index: u32 = alias.strip_prefix("aux")?.parse().ok()?;
    (index < MAX_AUX).then(|| format!("aux{}", index))
}

/// One half of the virtual device pair as presented to the host.
#[derive(Debug, Clone)]
pub struct VirtualDevice {
    pub name: String,
    pub description: String,
    pub kind: DeviceKind,
    pub spec: SampleSpec,
    pub channel_map: ChannelMap,
}

/// Capabilities a host audio server provides to a [`super::DevicePair`].
///
/// `register` and `unlink` are called from the thread that loads and
/// unloads the pair. `render`, `post` and `request_unload` are called from
/// the pair's real-time thread, so implementations must synchronise them
/// with their own audio queues.
pub trait HostServer: Send + Sync + 'static {
    /// Sample spec and channel map used when the load arguments leave them out.
    fn default_sample_spec(&self) -> (SampleSpec, ChannelMap);

    /// Publish the pair so applications can select it.
    fn register(&self, sink: &VirtualDevice, source: &VirtualDevice) -> Result<()>;

    /// Mix up to `requested_frames` frames that applications played into
    /// the sink. `None` when nothing is queued.
    fn render(&self, requested_frames: usize) -> Option<Bytes>;

    /// Queue lambda output on the source for recording applications.
    fn post(&self, chunk: Bytes);

    /// Remove both devices from the host's directory. No `render` or `post`
    /// reaches an application after this returns.
    fn unlink(&self);

    /// Ask the host to unload the pair; the pair's relay cannot continue.
    fn request_unload(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_map_accepts_aliases_and_aux() {
        let map = ChannelMap::parse("left, right,aux7,LFE").unwrap();
        assert_eq!(map.channels(), 4);
        assert_eq!(map.to_string(), "front-left,front-right,aux7,lfe");
    }

    #[test]
    fn channel_map_rejects_unknown_positions() {
        assert!(ChannelMap::parse("front-left,behind").is_err());
        assert!(ChannelMap::parse("aux32").is_err());
        assert!(ChannelMap::parse("").is_err());
    }

    #[test]
    fn default_maps() {
        assert_eq!(ChannelMap::default_for(1).to_string(), "mono");
        assert_eq!(ChannelMap::default_for(2).to_string(), "front-left,front-right");
        assert_eq!(ChannelMap::default_for(3).to_string(), "aux0,aux1,aux2");
    }
}
