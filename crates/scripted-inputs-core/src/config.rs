//! Scripted job configuration.
//!
//! [`ScriptJobConfig`] is the document form (YAML/JSON keys as operators
//! write them). [`ScriptJobConfig::validate`] turns it into [`JobSettings`],
//! the immutable compiled form a job runs with.
//!
//! ```yaml
//! script_name: cpu.sh
//! collection_interval: 30s
//! max_log_size: 1MiB
//! multiline:
//!   line_start_pattern: '^\d'
//! encoding: utf-8
//! source: cpu
//! sourcetype: scripted
//! add_attributes: true
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use regex::bytes::Regex;
use serde::{Deserialize, Serialize};

use crate::decode::Encoding;
use crate::environment::is_container;
use crate::error::ConfigError;
use crate::framing::FramingPolicy;
use crate::integrity::IntegrityRecord;

/// Smallest accepted `max_log_size`.
pub const MIN_MAX_LOG_SIZE: u64 = 64 * 1024;
/// `max_log_size` used when unset or zero.
pub const DEFAULT_MAX_LOG_SIZE: u64 = 1024 * 1024;
pub const DEFAULT_COLLECTION_INTERVAL: &str = "60s";
pub const DEFAULT_INTERPRETER: &str = "sh";

/// Multi-line grouping patterns. At most one may be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultilineConfig {
    pub line_start_pattern: Option<String>,
    pub line_end_pattern: Option<String>,
}

impl MultilineConfig {
    fn build(&self) -> Result<FramingPolicy, ConfigError> {
        let start = self.line_start_pattern.as_deref().filter(|p| !p.is_empty());
        let end = self.line_end_pattern.as_deref().filter(|p| !p.is_empty());
        match (start, end) {
            (None, None) => Ok(FramingPolicy::NoSplit),
            (Some(_), Some(_)) => Err(ConfigError::ConflictingPatterns),
            (Some(pattern), None) => compile(pattern).map(FramingPolicy::LineStart),
            (None, Some(pattern)) => compile(pattern).map(FramingPolicy::LineEnd),
        }
    }
}

fn compile(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Byte count that also accepts unit strings such as `64KiB` or `1mb`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "ByteSizeRepr", into = "u64")]
pub struct ByteSize(pub u64);

#[derive(Deserialize)]
#[serde(untagged)]
enum ByteSizeRepr {
    Bytes(u64),
    Text(String),
}

impl TryFrom<ByteSizeRepr> for ByteSize {
    type Error = String;

    fn try_from(repr: ByteSizeRepr) -> Result<Self, Self::Error> {
        match repr {
            ByteSizeRepr::Bytes(n) => Ok(Self(n)),
            ByteSizeRepr::Text(s) => s.parse(),
        }
    }
}

impl From<ByteSize> for u64 {
    fn from(size: ByteSize) -> Self {
        size.0
    }
}

impl FromStr for ByteSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let split = lowered
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(lowered.len());
        let (number, unit) = lowered.split_at(split);
        let multiplier: u64 = match unit.trim() {
            "" | "b" => 1,
            "k" | "kb" => 1_000,
            "ki" | "kib" => 1 << 10,
            "m" | "mb" => 1_000_000,
            "mi" | "mib" => 1 << 20,
            "g" | "gb" => 1_000_000_000,
            "gi" | "gib" => 1 << 30,
            other => return Err(format!("unknown size unit {other:?} in {s:?}")),
        };
        let value: f64 = number
            .parse()
            .map_err(|_| format!("invalid size {s:?}"))?;
        let bytes = (value * multiplier as f64).round();
        if !bytes.is_finite() || bytes < 0.0 || bytes > u64::MAX as f64 {
            return Err(format!("size {s:?} out of range"));
        }
        Ok(Self(bytes as u64))
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.0)
    }
}

/// Parse a duration such as `60s`, `1m30s`, `250ms` or `1.5h`.
///
/// Every number needs a unit (`ns`, `us`, `µs`, `ms`, `s`, `m`, `h`);
/// a bare `0` is the only exception.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let original = input;
    let mut s = input.trim();
    if let Some(rest) = s.strip_prefix('+') {
        s = rest;
    }
    if s.starts_with('-') {
        return Err(format!("negative duration {original:?}"));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(format!("invalid duration {original:?}"));
    }

    let mut total_nanos: u128 = 0;
    while !s.is_empty() {
        let num_end = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, rest) = s.split_at(num_end);
        if number.is_empty() || number == "." {
            return Err(format!("invalid duration {original:?}"));
        }
        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let (unit, rest) = rest.split_at(unit_end);
        let unit_nanos: u128 = match unit {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            "" => return Err(format!("missing unit in duration {original:?}")),
            other => return Err(format!("unknown unit {other:?} in duration {original:?}")),
        };

        let (whole, frac) = number.split_once('.').unwrap_or((number, ""));
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| format!("invalid duration {original:?}"))?
        };
        let mut nanos = whole
            .checked_mul(unit_nanos)
            .ok_or_else(|| format!("duration {original:?} overflows"))?;
        if !frac.is_empty() {
            let fraction: f64 = format!("0.{frac}")
                .parse()
                .map_err(|_| format!("invalid duration {original:?}"))?;
            nanos += (fraction * unit_nanos as f64).round() as u128;
        }
        total_nanos = total_nanos
            .checked_add(nanos)
            .ok_or_else(|| format!("duration {original:?} overflows"))?;
        s = rest;
    }

    let nanos = u64::try_from(total_nanos).map_err(|_| format!("duration {original:?} overflows"))?;
    Ok(Duration::from_nanos(nanos))
}

/// Job configuration as written by operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptJobConfig {
    /// Script file name under the scripts root.
    pub script_name: String,
    /// Time between cycle starts, e.g. `60s`.
    pub collection_interval: String,
    /// Largest frame in bytes; `0` means the default.
    pub max_log_size: ByteSize,
    pub multiline: MultilineConfig,
    pub encoding: String,
    pub source: String,
    #[serde(rename = "sourcetype")]
    pub source_type: String,
    /// Attach `source`/`sourcetype` to every record.
    pub add_attributes: bool,
    /// Program the script is passed to. Empty executes the script directly.
    pub interpreter: String,
    /// Extra arguments after the script path.
    pub args: Vec<String>,
    /// Working directory for the script; defaults to the scripts root.
    pub working_dir: Option<PathBuf>,
    /// Refuse to build the job inside a container.
    pub refuse_in_container: bool,
}

impl Default for ScriptJobConfig {
    fn default() -> Self {
        Self {
            script_name: String::new(),
            collection_interval: DEFAULT_COLLECTION_INTERVAL.to_string(),
            max_log_size: ByteSize(DEFAULT_MAX_LOG_SIZE),
            multiline: MultilineConfig::default(),
            encoding: "utf-8".to_string(),
            source: String::new(),
            source_type: String::new(),
            add_attributes: false,
            interpreter: DEFAULT_INTERPRETER.to_string(),
            args: Vec::new(),
            working_dir: None,
            refuse_in_container: false,
        }
    }
}

impl ScriptJobConfig {
    /// Config for `script_name` with every other field defaulted.
    #[must_use]
    pub fn for_script(script_name: impl Into<String>) -> Self {
        Self {
            script_name: script_name.into(),
            ..Self::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseFailed(e.to_string()))
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_yaml_str(&text)
    }

    /// Check every field and compile the runtime form.
    pub fn validate(&self, record: &IntegrityRecord) -> Result<JobSettings, ConfigError> {
        if self.script_name.is_empty() {
            return Err(ConfigError::MissingScriptName);
        }
        if !record.contains(&self.script_name) {
            return Err(ConfigError::UnknownScript {
                name: self.script_name.clone(),
                available: record.available_scripts(),
            });
        }

        let max_log_size = match self.max_log_size.0 {
            0 => DEFAULT_MAX_LOG_SIZE,
            n if n < MIN_MAX_LOG_SIZE => {
                return Err(ConfigError::MaxLogSizeTooSmall {
                    actual: n,
                    min: MIN_MAX_LOG_SIZE,
                });
            }
            n => n,
        };
        let max_log_size = usize::try_from(max_log_size)
            .map_err(|_| ConfigError::InvalidByteSize(format!("{max_log_size} does not fit in memory")))?;

        let interval = parse_duration(&self.collection_interval).map_err(ConfigError::InvalidInterval)?;
        if interval.is_zero() {
            return Err(ConfigError::InvalidInterval(
                "must be greater than zero".to_string(),
            ));
        }

        let framing = self.multiline.build()?;
        let encoding = Encoding::lookup(&self.encoding)
            .ok_or_else(|| ConfigError::UnsupportedEncoding(self.encoding.clone()))?;

        if self.refuse_in_container && is_container() {
            return Err(ConfigError::ContainerUnsupported);
        }

        let interpreter = Some(self.interpreter.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_owned);

        Ok(JobSettings {
            script_name: self.script_name.clone(),
            interval,
            max_log_size,
            framing,
            encoding,
            source: self.source.clone(),
            source_type: self.source_type.clone(),
            add_attributes: self.add_attributes,
            interpreter,
            args: self.args.clone(),
            working_dir: self.working_dir.clone(),
        })
    }
}

/// Validated, immutable job settings.
#[derive(Debug, Clone)]
pub struct JobSettings {
    pub script_name: String,
    pub interval: Duration,
    pub max_log_size: usize,
    pub framing: FramingPolicy,
    pub encoding: Encoding,
    pub source: String,
    pub source_type: String,
    pub add_attributes: bool,
    pub interpreter: Option<String>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> IntegrityRecord {
        IntegrityRecord::from_entries([("cpu.sh", "aa"), ("df.sh", "bb")])
    }

    #[test]
    fn defaults_validate() {
        let settings = ScriptJobConfig::for_script("cpu.sh").validate(&record()).unwrap();
        assert_eq!(settings.interval, Duration::from_secs(60));
        assert_eq!(settings.max_log_size, 1024 * 1024);
        assert_eq!(settings.encoding, Encoding::Utf8);
        assert_eq!(settings.interpreter.as_deref(), Some("sh"));
        assert!(matches!(settings.framing, FramingPolicy::NoSplit));
    }

    #[test]
    fn yaml_document_parses() {
        let yaml = r#"
script_name: cpu.sh
collection_interval: 1m30s
max_log_size: 128KiB
multiline:
  line_start_pattern: '^\d'
encoding: UTF-16LE
source: cpu
sourcetype: scripted
add_attributes: true
"#;
        let config = ScriptJobConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.source_type, "scripted");
        assert_eq!(config.max_log_size, ByteSize(128 * 1024));

        let settings = config.validate(&record()).unwrap();
        assert_eq!(settings.interval, Duration::from_secs(90));
        assert_eq!(settings.encoding, Encoding::Utf16Le);
        assert!(matches!(settings.framing, FramingPolicy::LineStart(_)));
        assert!(settings.add_attributes);
    }

    #[test]
    fn missing_and_unknown_script_names() {
        assert!(matches!(
            ScriptJobConfig::default().validate(&record()),
            Err(ConfigError::MissingScriptName)
        ));
        match ScriptJobConfig::for_script("nope.sh").validate(&record()) {
            Err(ConfigError::UnknownScript { available, .. }) => {
                assert_eq!(available, vec!["cpu.sh", "df.sh"]);
            }
            other => panic!("expected UnknownScript, got {other:?}"),
        }
    }

    #[test]
    fn max_log_size_bounds() {
        let mut config = ScriptJobConfig::for_script("cpu.sh");
        config.max_log_size = ByteSize(MIN_MAX_LOG_SIZE - 1);
        assert!(matches!(
            config.validate(&record()),
            Err(ConfigError::MaxLogSizeTooSmall { .. })
        ));

        config.max_log_size = ByteSize(MIN_MAX_LOG_SIZE);
        assert_eq!(config.validate(&record()).unwrap().max_log_size, 65536);

        config.max_log_size = ByteSize(0);
        assert_eq!(
            config.validate(&record()).unwrap().max_log_size,
            DEFAULT_MAX_LOG_SIZE as usize
        );
    }

    #[test]
    fn interval_must_parse_and_be_positive() {
        let mut config = ScriptJobConfig::for_script("cpu.sh");
        for bad in ["60", "soon", "0s", "0", "-5s", "5 parsecs"] {
            config.collection_interval = bad.to_string();
            assert!(
                matches!(config.validate(&record()), Err(ConfigError::InvalidInterval(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn conflicting_and_invalid_patterns() {
        let mut config = ScriptJobConfig::for_script("cpu.sh");
        config.multiline.line_start_pattern = Some("^a".to_string());
        config.multiline.line_end_pattern = Some("b$".to_string());
        assert!(matches!(
            config.validate(&record()),
            Err(ConfigError::ConflictingPatterns)
        ));

        config.multiline.line_end_pattern = None;
        config.multiline.line_start_pattern = Some("([".to_string());
        assert!(matches!(
            config.validate(&record()),
            Err(ConfigError::InvalidPattern { .. })
        ));

        config.multiline.line_start_pattern = Some(String::new());
        config.multiline.line_end_pattern = Some("^END$".to_string());
        assert!(matches!(
            config.validate(&record()).unwrap().framing,
            FramingPolicy::LineEnd(_)
        ));
    }

    #[test]
    fn unsupported_encoding() {
        let mut config = ScriptJobConfig::for_script("cpu.sh");
        config.encoding = "ebcdic".to_string();
        assert!(matches!(
            config.validate(&record()),
            Err(ConfigError::UnsupportedEncoding(_))
        ));
    }

    #[test]
    fn empty_interpreter_executes_directly() {
        let mut config = ScriptJobConfig::for_script("cpu.sh");
        config.interpreter = "  ".to_string();
        assert!(config.validate(&record()).unwrap().interpreter.is_none());
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("1h2m3s").unwrap(), Duration::from_secs(3723));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("10us").unwrap(), Duration::from_micros(10));
        assert_eq!(parse_duration("10µs").unwrap(), Duration::from_micros(10));
        assert_eq!(parse_duration("+2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("").is_err());
        assert!(parse_duration("1d").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn byte_size_parsing() {
        assert_eq!("1024".parse::<ByteSize>().unwrap(), ByteSize(1024));
        assert_eq!("64KiB".parse::<ByteSize>().unwrap(), ByteSize(65536));
        assert_eq!("1mb".parse::<ByteSize>().unwrap(), ByteSize(1_000_000));
        assert_eq!("1.5 MiB".parse::<ByteSize>().unwrap(), ByteSize(1_572_864));
        assert!("12 parsecs".parse::<ByteSize>().is_err());
        assert!("".parse::<ByteSize>().is_err());

        let from_int: ScriptJobConfig = serde_yaml::from_str("max_log_size: 70000").unwrap();
        assert_eq!(from_int.max_log_size, ByteSize(70000));
    }
}
