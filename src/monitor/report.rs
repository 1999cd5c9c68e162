//! Monitor report line
//!
//! The monitor talks back to the sandbox through exactly one line of stdout:
//!
//! ```text
//! OK <cpu_seconds> <max_rss_kb>
//! RTE (<reason>)
//! MLE (<reason>)
//! TLE (<reason>)
//! ```
//!
//! The first whitespace-separated token is always the status tag.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorReport {
    Ok { cpu_time: Duration, max_rss_kb: u64 },
    RuntimeError(String),
    MemoryLimitExceeded(String),
    TimeLimitExceeded(String),
}

#[derive(Debug, Error)]
#[error("malformed monitor report: {0:?}")]
pub struct MalformedReport(pub String);

impl MonitorReport {
    pub fn tag(&self) -> &'static str {
        match self {
            MonitorReport::Ok { .. } => "OK",
            MonitorReport::RuntimeError(_) => "RTE",
            MonitorReport::MemoryLimitExceeded(_) => "MLE",
            MonitorReport::TimeLimitExceeded(_) => "TLE",
        }
    }
}

impl fmt::Display for MonitorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorReport::Ok {
                cpu_time,
                max_rss_kb,
            } => write!(f, "OK {:.3} {}", cpu_time.as_secs_f64(), max_rss_kb),
            MonitorReport::RuntimeError(reason)
            | MonitorReport::MemoryLimitExceeded(reason)
            | MonitorReport::TimeLimitExceeded(reason) => {
                // reasons never span lines
                write!(f, "{} ({})", self.tag(), reason.replace('\n', " "))
            }
        }
    }
}

impl FromStr for MonitorReport {
    type Err = MalformedReport;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || MalformedReport(s.to_string());

        let line = s.lines().next().ok_or_else(malformed)?.trim();
        let (tag, rest) = match line.split_once(char::is_whitespace) {
            Some((tag, rest)) => (tag, rest.trim()),
            None => (line, ""),
        };

        if tag == "OK" {
            let mut fields = rest.split_whitespace();
            let cpu_secs: f64 = fields
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(malformed)?;
            let max_rss_kb: u64 = fields
                .next()
                .and_then(|v| v.parse().ok())
                .ok_or_else(malformed)?;
            if fields.next().is_some() || !cpu_secs.is_finite() || cpu_secs < 0.0 {
                return Err(malformed());
            }
            return Ok(MonitorReport::Ok {
                cpu_time: Duration::from_secs_f64(cpu_secs),
                max_rss_kb,
            });
        }

        let reason = rest
            .strip_prefix('(')
            .and_then(|r| r.strip_suffix(')'))
            .ok_or_else(malformed)?
            .to_string();

        match tag {
            "RTE" => Ok(MonitorReport::RuntimeError(reason)),
            "MLE" => Ok(MonitorReport::MemoryLimitExceeded(reason)),
            "TLE" => Ok(MonitorReport::TimeLimitExceeded(reason)),
            _ => Err(malformed()),
        }
    }
}

/// Parse a memory size: raw bytes or a number with a K/M/G suffix (binary units)
pub fn parse_memory(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (digits, shift) = match s.chars().last() {
        Some('k' | 'K') => (&s[..s.len() - 1], 10),
        Some('m' | 'M') => (&s[..s.len() - 1], 20),
        Some('g' | 'G') => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid memory size: {:?}", s))?;
    value
        .checked_mul(1u64 << shift)
        .ok_or_else(|| format!("memory size overflows: {:?}", s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ok_line() {
        let report: MonitorReport = "OK 0.125 2048\n".parse().unwrap();
        assert_eq!(
            report,
            MonitorReport::Ok {
                cpu_time: Duration::from_millis(125),
                max_rss_kb: 2048
            }
        );
    }

    #[test]
    fn test_parse_failure_lines() {
        let report: MonitorReport = "RTE (invalid memory access)".parse().unwrap();
        assert_eq!(
            report,
            MonitorReport::RuntimeError("invalid memory access".into())
        );

        let report: MonitorReport = "TLE (cpu time limit exceeded)".parse().unwrap();
        assert_eq!(report.tag(), "TLE");
    }

    #[test]
    fn test_display_is_parseable() {
        let report = MonitorReport::RuntimeError("unknown signal SIGBUS".into());
        assert_eq!(report.to_string(), "RTE (unknown signal SIGBUS)");
        assert_eq!(report.to_string().parse::<MonitorReport>().unwrap(), report);

        let ok = MonitorReport::Ok {
            cpu_time: Duration::from_millis(1500),
            max_rss_kb: 10,
        };
        assert_eq!(ok.to_string(), "OK 1.500 10");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<MonitorReport>().is_err());
        assert!("hello world".parse::<MonitorReport>().is_err());
        assert!("OK".parse::<MonitorReport>().is_err());
        assert!("OK 1.0".parse::<MonitorReport>().is_err());
        assert!("OK 1.0 12 extra".parse::<MonitorReport>().is_err());
        assert!("OK -1.0 12".parse::<MonitorReport>().is_err());
        assert!("RTE reason without parens".parse::<MonitorReport>().is_err());
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("1024").unwrap(), 1024);
        assert_eq!(parse_memory("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_memory("64m").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_memory("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_memory("abc").is_err());
        assert!(parse_memory("M").is_err());
        assert!(parse_memory("99999999999999G").is_err());
    }
}
