use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use sha1::Sha1;

/// Outcome of a host key check.
#[derive(Debug, Clone)]
pub struct HostKeyDecision {
    pub verified: bool,
    pub reason: Option<String>,
}

impl HostKeyDecision {
    fn ok() -> Self {
        HostKeyDecision {
            verified: true,
            reason: None,
        }
    }

    fn rejected(reason: String) -> Self {
        HostKeyDecision {
            verified: false,
            reason: Some(reason),
        }
    }
}

#[derive(Debug, Clone)]
struct KnownHostEntry {
    matchers: Vec<String>,
    key_type: String,
    key_base64: String,
}

/// OpenSSH `known_hosts` verifier with optional trust-on-first-use.
///
/// The file is parsed eagerly at construction; `verify` appends a new entry
/// under trust-on-first-use, which is the only mutation ever performed.
pub struct KnownHostsVerifier {
    path: PathBuf,
    trust_on_first_use: bool,
    entries: Mutex<Vec<KnownHostEntry>>,
}

impl KnownHostsVerifier {
    pub fn new(path: impl Into<PathBuf>, trust_on_first_use: bool) -> std::io::Result<Self> {
        let path = path.into();
        let entries = match std::fs::read_to_string(&path) {
            Ok(contents) => parse_known_hosts(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        Ok(KnownHostsVerifier {
            path,
            trust_on_first_use,
            entries: Mutex::new(entries),
        })
    }

    /// Check a presented host key. `key_base64` is the standard base64
    /// encoding of the public key blob, as it appears in `known_hosts`.
    pub fn verify(
        &self,
        host: &str,
        port: u16,
        key_type: &str,
        key_base64: &str,
    ) -> HostKeyDecision {
        let probes = if port == 22 {
            vec![host.to_string()]
        } else {
            vec![format!("[{host}]:{port}"), host.to_string()]
        };

        let mut entries = self.entries.lock().expect("known_hosts lock poisoned");
        let matching: Vec<&KnownHostEntry> = entries
            .iter()
            .filter(|entry| {
                entry
                    .matchers
                    .iter()
                    .any(|m| probes.iter().any(|p| matcher_matches(m, p)))
            })
            .collect();

        if matching.is_empty() {
            if !self.trust_on_first_use {
                return HostKeyDecision::rejected(format!(
                    "UNKNOWN HOST: no known_hosts entry for {host}:{port} and \
                     trust-on-first-use is disabled. Add the host key to {} to proceed.",
                    self.path.display()
                ));
            }
            let entry_host = if port == 22 {
                host.to_string()
            } else {
                format!("[{host}]:{port}")
            };
            let line = format!("{entry_host} {key_type} {key_base64}\n");
            if let Err(e) = append_line(&self.path, &line) {
                return HostKeyDecision::rejected(format!(
                    "FAILED TO SAVE host key for {host}:{port} to {}: {e}",
                    self.path.display()
                ));
            }
            log::info!("trusted new host key for {entry_host} ({key_type})");
            entries.push(KnownHostEntry {
                matchers: vec![entry_host],
                key_type: key_type.to_string(),
                key_base64: key_base64.to_string(),
            });
            return HostKeyDecision::ok();
        }

        let key_matches = matching
            .iter()
            .any(|entry| entry.key_type == key_type && entry.key_base64 == key_base64);
        if key_matches {
            return HostKeyDecision::ok();
        }

        // Mismatch is never converted to trust-on-first-use.
        HostKeyDecision::rejected(format!(
            "HOST KEY MISMATCH for {host}:{port}: the presented {key_type} key does not \
             match the recorded entry. If the server key was intentionally changed, remove \
             the stale line from {} and retry.",
            self.path.display()
        ))
    }
}

fn append_line(path: &PathBuf, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())
}

fn parse_known_hosts(contents: &str) -> Vec<KnownHostEntry> {
    let mut entries = Vec::new();
    for (number, raw) in contents.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with('@') {
            log::debug!("skipping known_hosts marker line {}: {line}", number + 1);
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(matchers), Some(key_type), Some(key_base64)) =
            (parts.next(), parts.next(), parts.next())
        else {
            log::debug!("skipping malformed known_hosts line {}", number + 1);
            continue;
        };
        entries.push(KnownHostEntry {
            matchers: matchers.split(',').map(normalize_matcher).collect(),
            key_type: key_type.to_string(),
            key_base64: key_base64.to_string(),
        });
    }
    entries
}

/// `[host]:22` collapses to `host`; every other form is kept verbatim.
fn normalize_matcher(matcher: &str) -> String {
    if let Some(stripped) = matcher.strip_prefix('[') {
        if let Some((host, port)) = stripped.split_once("]:") {
            if port == "22" {
                return host.to_string();
            }
        }
    }
    matcher.to_string()
}

fn matcher_matches(matcher: &str, probe: &str) -> bool {
    if matcher.starts_with("|1|") {
        return hashed_matcher_matches(matcher, probe);
    }
    matcher.eq_ignore_ascii_case(probe)
}

/// `|1|base64(salt)|base64(hmac-sha1(salt, host))`
fn hashed_matcher_matches(matcher: &str, probe: &str) -> bool {
    let mut parts = matcher.splitn(4, '|');
    let (Some(_), Some(version), Some(salt_b64), Some(hash_b64)) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if version != "1" {
        return false;
    }
    let Ok(salt) = BASE64.decode(salt_b64) else {
        return false;
    };
    hmac_sha1_base64(&salt, probe) == hash_b64
}

fn hmac_sha1_base64(salt: &[u8], data: &str) -> String {
    let mut mac =
        Hmac::<Sha1>::new_from_slice(salt).expect("hmac accepts any key length");
    mac.update(data.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TempKnownHosts {
        path: PathBuf,
    }

    impl TempKnownHosts {
        fn new(contents: Option<&str>) -> Self {
            let path = std::env::temp_dir().join(format!(
                "known_hosts_test_{}",
                uuid::Uuid::new_v4()
            ));
            if let Some(contents) = contents {
                std::fs::write(&path, contents).unwrap();
            }
            TempKnownHosts { path }
        }
    }

    impl Drop for TempKnownHosts {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    const KEY: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIKq7";
    const OTHER_KEY: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIDif";

    #[test]
    fn test_plain_entry_matches_port_22() {
        let file = TempKnownHosts::new(Some(&format!("example.com ssh-ed25519 {KEY}\n")));
        let verifier = KnownHostsVerifier::new(&file.path, false).unwrap();
        let decision = verifier.verify("example.com", 22, "ssh-ed25519", KEY);
        assert!(decision.verified);
    }

    #[test]
    fn test_bracketed_port_22_normalizes_to_plain() {
        let file = TempKnownHosts::new(Some(&format!("[example.com]:22 ssh-ed25519 {KEY}\n")));
        let verifier = KnownHostsVerifier::new(&file.path, false).unwrap();
        assert!(verifier.verify("example.com", 22, "ssh-ed25519", KEY).verified);
    }

    #[test]
    fn test_non_standard_port_probes_bracketed_then_plain() {
        let file = TempKnownHosts::new(Some(&format!(
            "[bastion.internal]:2222 ssh-rsa {KEY}\nbastion.internal ssh-ed25519 {OTHER_KEY}\n"
        )));
        let verifier = KnownHostsVerifier::new(&file.path, false).unwrap();
        assert!(verifier.verify("bastion.internal", 2222, "ssh-rsa", KEY).verified);
        // Falls back to the plain-hostname entry.
        assert!(
            verifier
                .verify("bastion.internal", 2222, "ssh-ed25519", OTHER_KEY)
                .verified
        );
    }

    #[test]
    fn test_hashed_entry_matches() {
        let salt = b"0123456789abcdefghij";
        let matcher = format!(
            "|1|{}|{}",
            BASE64.encode(salt),
            hmac_sha1_base64(salt, "example.com")
        );
        let file = TempKnownHosts::new(Some(&format!("{matcher} ssh-ed25519 {KEY}\n")));
        let verifier = KnownHostsVerifier::new(&file.path, false).unwrap();
        assert!(verifier.verify("example.com", 22, "ssh-ed25519", KEY).verified);
        assert!(!verifier.verify("other.com", 22, "ssh-ed25519", KEY).verified);
    }

    #[test]
    fn test_unknown_host_without_tofu() {
        let file = TempKnownHosts::new(Some(""));
        let verifier = KnownHostsVerifier::new(&file.path, false).unwrap();
        let decision = verifier.verify("example.com", 22, "ssh-ed25519", KEY);
        assert!(!decision.verified);
        assert!(decision.reason.unwrap().contains("UNKNOWN HOST"));
    }

    #[test]
    fn test_trust_on_first_use_appends_and_pins() {
        let file = TempKnownHosts::new(None);
        let verifier = KnownHostsVerifier::new(&file.path, true).unwrap();

        let first = verifier.verify("example.com", 22, "ssh-ed25519", KEY);
        assert!(first.verified);
        let saved = std::fs::read_to_string(&file.path).unwrap();
        assert!(saved.contains(&format!("example.com ssh-ed25519 {KEY}")));

        // The freshly trusted key is now pinned: a different key is a
        // mismatch, not another first use.
        let second = verifier.verify("example.com", 22, "ssh-ed25519", OTHER_KEY);
        assert!(!second.verified);
        assert!(second.reason.unwrap().contains("HOST KEY MISMATCH"));
    }

    #[test]
    fn test_tofu_uses_bracketed_form_for_non_22() {
        let file = TempKnownHosts::new(None);
        let verifier = KnownHostsVerifier::new(&file.path, true).unwrap();
        assert!(verifier.verify("bastion", 2222, "ssh-rsa", KEY).verified);
        let saved = std::fs::read_to_string(&file.path).unwrap();
        assert!(saved.contains(&format!("[bastion]:2222 ssh-rsa {KEY}")));
    }

    #[test]
    fn test_mismatch_overrides_tofu() {
        let file = TempKnownHosts::new(Some(&format!("example.com ssh-ed25519 {KEY}\n")));
        let verifier = KnownHostsVerifier::new(&file.path, true).unwrap();
        let decision = verifier.verify("example.com", 22, "ssh-ed25519", OTHER_KEY);
        assert!(!decision.verified);
        assert!(decision.reason.unwrap().contains("HOST KEY MISMATCH"));
        // Nothing was appended.
        let saved = std::fs::read_to_string(&file.path).unwrap();
        assert_eq!(saved.lines().count(), 1);
    }

    #[test]
    fn test_marker_and_comment_lines_skipped() {
        let file = TempKnownHosts::new(Some(&format!(
            "# comment\n@cert-authority *.example.com ssh-rsa {OTHER_KEY}\n\
             example.com ssh-ed25519 {KEY}\n"
        )));
        let verifier = KnownHostsVerifier::new(&file.path, false).unwrap();
        assert!(verifier.verify("example.com", 22, "ssh-ed25519", KEY).verified);
    }

    #[test]
    fn test_duplicate_entries_any_match_wins() {
        let file = TempKnownHosts::new(Some(&format!(
            "example.com ssh-ed25519 {OTHER_KEY}\nexample.com ssh-ed25519 {KEY}\n"
        )));
        let verifier = KnownHostsVerifier::new(&file.path, false).unwrap();
        assert!(verifier.verify("example.com", 22, "ssh-ed25519", KEY).verified);
        assert!(verifier.verify("example.com", 22, "ssh-ed25519", OTHER_KEY).verified);
    }

    #[test]
    fn test_deterministic_outcome() {
        let file = TempKnownHosts::new(Some(&format!("example.com ssh-ed25519 {KEY}\n")));
        let verifier = KnownHostsVerifier::new(&file.path, false).unwrap();
        for _ in 0..3 {
            assert!(verifier.verify("example.com", 22, "ssh-ed25519", KEY).verified);
            assert!(!verifier.verify("example.com", 22, "ssh-rsa", KEY).verified);
        }
    }
}
