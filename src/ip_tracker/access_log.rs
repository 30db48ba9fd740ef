//! Incremental reader and parser for the core's access log.
//!
//! Lines look like:
//! ```text
//! 2024/05/01 10:00:00.123456 from tcp:203.0.113.9:51234 accepted tcp:example.com:443 [vless-443 >> direct] email: alice
//! ```

use std::io::SeekFrom;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::compiler::API_TAG;

/// A client connection taken from one access-log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessEntry {
    pub email: String,
    pub ip: IpAddr,
    /// Seconds on the core's local wall clock when the line was written.
    /// Only differences between entries are meaningful.
    pub logged_at: Option<u64>,
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let year = if month <= 2 { year - 1 } else { year };
    let era = year.div_euclid(400);
    let yoe = year - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Parse the leading `YYYY/MM/DD HH:MM:SS[.frac]` stamp of a line.
fn parse_timestamp(line: &str) -> Option<u64> {
    let mut tokens = line.split_whitespace();
    let date = tokens.next()?;
    let time = tokens.next()?;

    let mut ymd = date.split('/').map(|p| p.parse::<i64>().ok());
    let (year, month, day) = (ymd.next()??, ymd.next()??, ymd.next()??);
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }

    let whole = time.split('.').next()?;
    let mut hms = whole.split(':').map(|p| p.parse::<i64>().ok());
    let (hour, minute, second) = (hms.next()??, hms.next()??, hms.next()??);
    if hour > 23 || minute > 59 || second > 60 {
        return None;
    }

    let secs = days_from_civil(year, month, day) * 86_400 + hour * 3_600 + minute * 60 + second;
    u64::try_from(secs).ok()
}

fn parse_source(token: &str) -> Option<IpAddr> {
    let addr = token
        .strip_prefix("tcp:")
        .or_else(|| token.strip_prefix("udp:"))
        .unwrap_or(token);

    if let Ok(sock) = addr.parse::<SocketAddr>() {
        return Some(sock.ip());
    }
    // Bare IP without a port.
    if let Ok(ip) = addr.parse::<IpAddr>() {
        return Some(ip);
    }
    let (host, _port) = addr.rsplit_once(':')?;
    host.trim_start_matches('[').trim_end_matches(']').parse().ok()
}

/// Extract the client email and source IP from a log line.
///
/// Lines without an email, or routed through the API inbound, yield `None`.
pub fn parse_line(line: &str) -> Option<AccessEntry> {
    let api_route = format!("[{} ", API_TAG);
    if line.contains(&api_route) {
        return None;
    }

    let (_, after_from) = line.split_once(" from ")?;
    let source = after_from.split_whitespace().next()?;
    let ip = parse_source(source)?;

    let (_, after_email) = line.rsplit_once("email:")?;
    let email = after_email.split_whitespace().next()?;
    if email.is_empty() {
        return None;
    }

    Some(AccessEntry {
        email: email.to_string(),
        ip,
        logged_at: parse_timestamp(line),
    })
}

/// Follows a log file, returning only lines appended since the last read.
#[derive(Debug)]
pub struct AccessLogTail {
    path: PathBuf,
    offset: u64,
}

impl AccessLogTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
        }
    }

    /// Start over from the beginning of the file.
    pub fn rewind(&mut self) {
        self.offset = 0;
    }

    /// Complete lines written since the previous call.
    ///
    /// A missing file reads as empty. A file shorter than the saved offset
    /// was truncated and is read from the start. A trailing partial line is
    /// left for the next call.
    pub async fn read_new_lines(&mut self) -> std::io::Result<Vec<String>> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let len = file.metadata().await?.len();
        if len < self.offset {
            tracing::debug!(path = %self.path.display(), "Access log truncated, reading from start");
            self.offset = 0;
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::with_capacity((len - self.offset) as usize);
        file.read_to_end(&mut buf).await?;

        let Some(last_newline) = buf.iter().rposition(|&b| b == b'\n') else {
            return Ok(Vec::new());
        };
        self.offset += last_newline as u64 + 1;

        Ok(String::from_utf8_lossy(&buf[..last_newline])
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(str::to_string)
            .collect())
    }
}
