//! Small shared helpers: digests, duration parsing and the shutdown signal
//! listener.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use eyre::{eyre, Result};
use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};

type HmacSha1 = Hmac<Sha1>;

/// Parse `"300ms"`, `"90s"`, `"5m"`, `"2h"`, `"1d"` or a bare number of
/// seconds.
pub fn parse_duration(text: &str) -> Option<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(secs) = text.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let split = text.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (num, unit) = text.split_at(split);
    let num: f64 = num.parse().ok()?;

    let secs = match unit {
        "ms" => num / 1000.0,
        "s" => num,
        "m" => num * 60.0,
        "h" => num * 3600.0,
        "d" => num * 86400.0,
        _ => return None,
    };
    (secs >= 0.0).then(|| Duration::from_secs_f64(secs))
}

pub fn md5_hex(data: &str) -> String {
    format!("{:x}", md5::compute(data.as_bytes()))
}

pub fn sha1_hex(data: &[u8]) -> String {
    let digest = Sha1::digest(data);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// HMAC-SHA1 signature, URL-safe base64.
pub fn hmac_sign(data: &str, key: &str) -> Result<String> {
    let mut mac =
        HmacSha1::new_from_slice(key.as_bytes()).map_err(|e| eyre!("hmac key: {e}"))?;
    mac.update(data.as_bytes());
    Ok(URL_SAFE.encode(mac.finalize().into_bytes()))
}

pub fn hmac_verify(data: &str, sign: &str, key: &str) -> Result<()> {
    let sig = URL_SAFE.decode(sign)?;
    let mut mac =
        HmacSha1::new_from_slice(key.as_bytes()).map_err(|e| eyre!("hmac key: {e}"))?;
    mac.update(data.as_bytes());
    mac.verify_slice(&sig).map_err(|_| eyre!("signature mismatch"))
}

/// Block until the process receives a shutdown signal (SIGINT, SIGTERM,
/// SIGHUP or SIGQUIT; Ctrl+C elsewhere).
pub async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate()).expect("register SIGTERM");
        let mut hup = signal(SignalKind::hangup()).expect("register SIGHUP");
        let mut quit = signal(SignalKind::quit()).expect("register SIGQUIT");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
            _ = hup.recv() => {}
            _ = quit.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations() {
        assert_eq!(parse_duration("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("1d"), Some(Duration::from_secs(86400)));
        assert_eq!(parse_duration("bogus"), None);
    }

    #[test]
    fn hmac_roundtrip_and_mismatch() {
        let sign = hmac_sign("payload", "secret").unwrap();
        assert!(hmac_verify("payload", &sign, "secret").is_ok());
        assert!(hmac_verify("payload", &sign, "other").is_err());
        assert!(hmac_verify("tampered", &sign, "secret").is_err());
    }

    #[test]
    fn digest_shapes() {
        assert_eq!(md5_hex("abc"), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(sha1_hex(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }
}
