//! Module load arguments: `key=value` pairs separated by whitespace, with
//! optional single or double quotes around values.

use std::collections::HashMap;

use crate::audio::SampleEncoding;
use crate::config::Config;
use crate::error::{BridgeError, Result};

use super::host::{ChannelMap, SampleSpec};

const VALID_KEYS: &[&str] = &[
    "sink_name",
    "source_name",
    "lambda_command",
    "format",
    "rate",
    "channels",
    "channel_map",
];

const MAX_RATE: u32 = 384_000;
const MAX_CHANNELS: u32 = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleArgs {
    pub sink_name: String,
    pub source_name: String,
    pub lambda_command: String,
    pub format: Option<SampleEncoding>,
    pub rate: Option<u32>,
    pub channels: Option<u32>,
    pub channel_map: Option<ChannelMap>,
}

impl ModuleArgs {
    pub fn parse(args: &str, config: &Config) -> Result<Self> {
        let mut values = tokenize(args)?;

        let lambda_command = values
            .remove("lambda_command")
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| BridgeError::ModuleArgs("lambda_command is required".to_string()))?;

        let format = values
            .remove("format")
            .map(|f| {
                SampleEncoding::parse(&f)
                    .ok_or_else(|| BridgeError::ModuleArgs(format!("unsupported sample format '{}'", f)))
            })
            .transpose()?;

        let rate = values
            .remove("rate")
            .map(|r| parse_ranged("rate", &r, MAX_RATE))
            .transpose()?;
        let channels = values
            .remove("channels")
            .map(|c| parse_ranged("channels", &c, MAX_CHANNELS))
            .transpose()?;
        let channel_map = values
            .remove("channel_map")
            .map(|m| ChannelMap::parse(&m))
            .transpose()?;

        Ok(Self {
            sink_name: values
                .remove("sink_name")
                .unwrap_or_else(|| config.module_sink_name.to_string()),
            source_name: values
                .remove("source_name")
                .unwrap_or_else(|| config.module_source_name.to_string()),
            lambda_command,
            format,
            rate,
            channels,
            channel_map,
        })
    }

    /// Apply the arguments on top of the host defaults.
    ///
    /// A channel map without a channel count sets the count; when both are
    /// given they must agree.
    pub fn resolve(&self, defaults: (SampleSpec, ChannelMap)) -> Result<(SampleSpec, ChannelMap)> {
        let (mut spec, default_map) = defaults;
        if let Some(format) = self.format {
            spec.encoding = format;
        }
        if let Some(rate) = self.rate {
            spec.rate = rate;
        }

        let map = match (&self.channel_map, self.channels) {
            (Some(map), Some(channels)) if map.channels() != channels => {
                return Err(BridgeError::ModuleArgs(format!(
                    "channel_map has {} positions but channels={}",
                    map.channels(),
                    channels
                )));
            }
            (Some(map), _) => map.clone(),
            (None, Some(channels)) if channels != default_map.channels() => ChannelMap::default_for(channels),
            (None, _) => default_map,
        };
        spec.channels = map.channels();

        if spec.channels == 0 || spec.rate == 0 {
            return Err(BridgeError::ModuleArgs(format!(
                "no usable sample spec: {} Hz, {} channels",
                spec.rate, spec.channels
            )));
        }
        Ok((spec, map))
    }
}

fn parse_ranged(key: &str, value: &str, max: u32) -> Result<u32> {
    match value.parse::<u32>() {
        Ok(v) if (1..=max).contains(&v) => Ok(v),
        _ => Err(BridgeError::ModuleArgs(format!(
            "{} must be between 1 and {}, got '{}'",
            key, max, value
        ))),
    }
}

fn tokenize(args: &str) -> Result<HashMap<String, String>> {
    let mut values = HashMap::new();
    let mut chars = args.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            return Ok(values);
        }

        let key: String = std::iter::from_fn(|| chars.next_if(|&c| c != '=' && !c.is_whitespace())).collect();
        if chars.next() != Some('=') {
            return Err(BridgeError::ModuleArgs(format!("expected key=value, got '{}'", key)));
        }
        if !VALID_KEYS.contains(&key.as_str()) {
            return Err(BridgeError::ModuleArgs(format!("unknown argument '{}'", key)));
        }

        let value = match chars.peek() {
            Some(&quote @ ('"' | '\'')) => {
                chars.next();
                let value: String = std::iter::from_fn(|| chars.next_if(|&c| c != quote)).collect();
                if chars.next() != Some(quote) {
                    return Err(BridgeError::ModuleArgs(format!("unterminated quote in '{}'", key)));
                }
                value
            }
            _ => std::iter::from_fn(|| chars.next_if(|c| !c.is_whitespace())).collect(),
        };

        if values.insert(key.clone(), value).is_some() {
            return Err(BridgeError::ModuleArgs(format!("'{}' given more than once", key)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &str) -> Result<ModuleArgs> {
        ModuleArgs::parse(args, &Config::new().unwrap())
    }

    fn host_defaults() -> (SampleSpec, ChannelMap) {
        (
            SampleSpec {
                encoding: SampleEncoding::S16Le,
                rate: 48000,
                channels: 2,
            },
            ChannelMap::default_for(2),
        )
    }

    #[test]
    fn defaults_and_quoted_command() {
        let args = parse(r#"lambda_command="sox -t raw - -t raw - gain -3""#).unwrap();
        assert_eq!(args.lambda_command, "sox -t raw - -t raw - gain -3");
        assert_eq!(args.sink_name, "lambda_sink");
        assert_eq!(args.source_name, "lambda_source");
        assert_eq!(args.rate, None);

        let (spec, map) = args.resolve(host_defaults()).unwrap();
        assert_eq!(spec.rate, 48000);
        assert_eq!(spec.channels, 2);
        assert_eq!(map, ChannelMap::default_for(2));
    }

    #[test]
    fn overrides_apply() {
        let args = parse("sink_name=fx_in source_name='fx out' lambda_command=cat format=s16le rate=22050 channels=1")
            .unwrap();
        assert_eq!(args.sink_name, "fx_in");
        assert_eq!(args.source_name, "fx out");

        let (spec, map) = args.resolve(host_defaults()).unwrap();
        assert_eq!(spec.rate, 22050);
        assert_eq!(spec.channels, 1);
        assert_eq!(map.to_string(), "mono");
    }

    #[test]
    fn channel_map_sets_channel_count() {
        let args = parse("lambda_command=cat channel_map=front-left,front-right,lfe").unwrap();
        let (spec, map) = args.resolve(host_defaults()).unwrap();
        assert_eq!(spec.channels, 3);
        assert_eq!(map.positions()[2], "lfe");

        let args = parse("lambda_command=cat channels=2 channel_map=mono").unwrap();
        assert!(args.resolve(host_defaults()).is_err());
    }

    #[test]
    fn empty_host_spec_needs_an_override() {
        let empty = || {
            let (spec, _) = host_defaults();
            (SampleSpec { channels: 0, ..spec }, ChannelMap::default_for(0))
        };
        let err = parse("lambda_command=cat").unwrap().resolve(empty()).unwrap_err();
        assert!(matches!(err, BridgeError::ModuleArgs(_)));

        let (spec, _) = parse("lambda_command=cat channels=1").unwrap().resolve(empty()).unwrap();
        assert_eq!(spec.channels, 1);
    }

    #[test]
    fn rejects_bad_arguments() {
        for bad in [
            "",
            "rate=44100",
            "lambda_command=",
            "lambda_command=cat volume=3",
            "lambda_command=cat rate=0",
            "lambda_command=cat rate=fast",
            "lambda_command=cat channels=33",
            "lambda_command=cat format=float32le",
            "lambda_command=cat channel_map=front-left,nowhere",
            "lambda_command='cat",
            "lambda_command=cat lambda_command=tee",
            "lambda_command",
        ] {
            let err = parse(bad).unwrap_err();
            assert!(matches!(err, BridgeError::ModuleArgs(_)), "{:?} accepted", bad);
        }
    }
}
