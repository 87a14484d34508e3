//! OpenSSH known_hosts verification
//!
//! Entries are matched against `host` on port 22 and `[host]:port`
//! otherwise, as OpenSSH writes them. Plain, wildcard, negated and hashed
//! (`|1|salt|hmac`) host patterns are understood. `@revoked` keys are
//! rejected for matching hosts; `@cert-authority` lines are ignored.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use russh::keys::{PublicKey, PublicKeyBase64};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Outcome of checking a server key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyVerification {
    Verified,
    /// No key of this type on record for the host
    Unknown { fingerprint: String },
    /// A different key of this type is on record (possible MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
    /// The key is listed under `@revoked`
    Revoked { fingerprint: String },
}

#[derive(Clone, Debug)]
enum HostPattern {
    /// Lowercased, may contain `*` and `?`
    Plain(String),
    Negated(String),
    Hashed { salt: Vec<u8>, hash: Vec<u8> },
}

impl HostPattern {
    fn parse(pattern: &str) -> Option<Self> {
        if let Some(hashed) = pattern.strip_prefix("|1|") {
            let (salt, hash) = hashed.split_once('|')?;
            return Some(HostPattern::Hashed {
                salt: BASE64.decode(salt).ok()?,
                hash: BASE64.decode(hash).ok()?,
            });
        }
        if pattern.starts_with('|') {
            return None;
        }
        match pattern.strip_prefix('!') {
            Some(negated) => Some(HostPattern::Negated(normalize_pattern(negated))),
            None => Some(HostPattern::Plain(normalize_pattern(pattern))),
        }
    }

    fn matches(&self, lookup_key: &str) -> bool {
        match self {
            HostPattern::Plain(p) | HostPattern::Negated(p) => glob_match(p, lookup_key),
            HostPattern::Hashed { salt, hash } => {
                let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(salt) else {
                    return false;
                };
                mac.update(lookup_key.as_bytes());
                mac.verify_slice(hash).is_ok()
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Marker {
    None,
    Revoked,
}

#[derive(Clone, Debug)]
struct HostKeyEntry {
    marker: Marker,
    patterns: Vec<HostPattern>,
    key_type: String,
    key_data: String,
}

impl HostKeyEntry {
    /// A negated match wins over any positive one
    fn matches(&self, lookup_key: &str) -> bool {
        let mut matched = false;
        for pattern in &self.patterns {
            if pattern.matches(lookup_key) {
                if matches!(pattern, HostPattern::Negated(_)) {
                    return false;
                }
                matched = true;
            }
        }
        matched
    }
}

/// In-memory view of a known_hosts file
pub struct KnownHosts {
    entries: RwLock<Vec<HostKeyEntry>>,
    path: PathBuf,
}

impl KnownHosts {
    /// `~/.ssh/known_hosts`, if a home directory exists
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".ssh").join("known_hosts"))
    }

    /// Load the file at `path`. A missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let entries = match fs::read_to_string(&path) {
            Ok(content) => parse(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("known_hosts not found at {:?}", path);
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        debug!("Loaded {} known_hosts entries from {:?}", entries.len(), path);
        Ok(Self {
            entries: RwLock::new(entries),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lookup key for host:port in known_hosts notation
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    /// SHA256 fingerprint in OpenSSH notation
    pub fn fingerprint(key: &PublicKey) -> String {
        fingerprint_bytes(&key.public_key_bytes())
    }

    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        let actual_type = key.algorithm().as_str().to_string();
        let actual_data = BASE64.encode(key.public_key_bytes());
        let fingerprint = Self::fingerprint(key);

        let entries = self.entries.read();
        let matching: Vec<&HostKeyEntry> = entries.iter().filter(|e| e.matches(&lookup_key)).collect();

        if matching
            .iter()
            .any(|e| e.marker == Marker::Revoked && e.key_type == actual_type && e.key_data == actual_data)
        {
            warn!("Host {} presented a revoked {} key {}", lookup_key, actual_type, fingerprint);
            return HostKeyVerification::Revoked { fingerprint };
        }

        let mut same_type = matching
            .into_iter()
            .filter(|e| e.marker == Marker::None && e.key_type == actual_type)
            .peekable();
        if same_type.peek().is_none() {
            debug!("Host {} has no {} key on record", lookup_key, actual_type);
            return HostKeyVerification::Unknown { fingerprint };
        }

        let mut expected = None;
        for entry in same_type {
            if entry.key_data == actual_data {
                debug!("Host key verified for {} ({})", lookup_key, actual_type);
                return HostKeyVerification::Verified;
            }
            expected.get_or_insert_with(|| {
                BASE64
                    .decode(&entry.key_data)
                    .map(|bytes| fingerprint_bytes(&bytes))
                    .unwrap_or_else(|_| "unknown".to_string())
            });
        }

        let expected_fingerprint = expected.unwrap_or_else(|| "unknown".to_string());
        warn!(
            "HOST KEY CHANGED for {} ({})! Expected {}, got {}",
            lookup_key, actual_type, expected_fingerprint, fingerprint
        );
        HostKeyVerification::Changed {
            expected_fingerprint,
            actual_fingerprint: fingerprint,
        }
    }

    /// Record a key in memory and append it to the file
    pub fn add_host(&self, host: &str, port: u16, key: &PublicKey) -> std::io::Result<()> {
        let lookup_key = Self::make_key(host, port);
        let key_type = key.algorithm().as_str().to_string();
        let key_data = BASE64.encode(key.public_key_bytes());

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{} {} {}", lookup_key, key_type, key_data)?;

        self.entries.write().push(HostKeyEntry {
            marker: Marker::None,
            patterns: vec![HostPattern::Plain(lookup_key.clone())],
            key_type,
            key_data,
        });

        info!("Added host key for {} to {:?}", lookup_key, self.path);
        Ok(())
    }
}

fn fingerprint_bytes(bytes: &[u8]) -> String {
    let hash = Sha256::digest(bytes);
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// `[host]:port` keeps the port unless it is 22; bare hosts are lowercased
fn normalize_pattern(pattern: &str) -> String {
    if let Some(rest) = pattern.strip_prefix('[') {
        if let Some((host, port)) = rest.split_once("]:") {
            return match port.parse::<u16>() {
                Ok(22) => host.to_lowercase(),
                _ => format!("[{}]:{}", host.to_lowercase(), port),
            };
        }
        return rest.trim_end_matches(']').to_lowercase();
    }
    pattern.to_lowercase()
}

/// OpenSSH pattern matching: `*` is any run of characters, `?` is one
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == '*')
}

fn parse(content: &str) -> Vec<HostKeyEntry> {
    let mut entries = Vec::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.split_whitespace();
        let Some(mut patterns) = parts.next() else {
            continue;
        };
        let marker = match patterns {
            "@revoked" => Marker::Revoked,
            "@cert-authority" => continue,
            m if m.starts_with('@') => {
                debug!("Skipping known_hosts line with marker {}", m);
                continue;
            }
            _ => Marker::None,
        };
        if marker != Marker::None {
            let Some(next) = parts.next() else {
                continue;
            };
            patterns = next;
        }

        let (Some(key_type), Some(key_data)) = (parts.next(), parts.next()) else {
            continue;
        };

        let patterns: Vec<HostPattern> = patterns.split(',').filter_map(HostPattern::parse).collect();
        if patterns.is_empty() {
            continue;
        }
        entries.push(HostKeyEntry {
            marker,
            patterns,
            key_type: key_type.to_string(),
            key_data: key_data.to_string(),
        });
    }

    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const KEY_A: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAILKota4rGQxip8NmQ2xqdXOg47YSk53UXQI/cCst5hvK";
    const KEY_A_FP: &str = "SHA256:1MQaQzRfUSLq9VGz4q/3k/iztAH0XwOjy7Mvgx0NwHc";
    const KEY_B: &str =
        "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAICb5idZENPLhuLchd1lYiX5nKcD8IRurudqW6FHDpbJ6";

    fn key(line: &str) -> PublicKey {
        PublicKey::from_openssh(line).unwrap()
    }

    #[test]
    fn test_normalize_pattern() {
        assert_eq!(normalize_pattern("GitHub.com"), "github.com");
        assert_eq!(normalize_pattern("[github.com]:22"), "github.com");
        assert_eq!(
            normalize_pattern("[server.example.com]:2222"),
            "[server.example.com]:2222"
        );
    }

    #[test]
    fn test_make_key() {
        assert_eq!(KnownHosts::make_key("github.com", 22), "github.com");
        assert_eq!(KnownHosts::make_key("server.com", 2222), "[server.com]:2222");
    }

    #[test]
    fn test_fingerprint_matches_openssh() {
        assert_eq!(KnownHosts::fingerprint(&key(KEY_A)), KEY_A_FP);
    }

    #[test]
    fn test_verify_outcomes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(
            &path,
            format!(
                "# comment\nbox1,10.0.0.5 {}\n[box2]:2222 {}\n|1|hashed= {}\n",
                KEY_A, KEY_A, KEY_B
            ),
        )
        .unwrap();
        let store = KnownHosts::load(&path).unwrap();

        assert_eq!(store.verify("box1", 22, &key(KEY_A)), HostKeyVerification::Verified);
        assert_eq!(store.verify("10.0.0.5", 22, &key(KEY_A)), HostKeyVerification::Verified);
        assert_eq!(store.verify("box2", 2222, &key(KEY_A)), HostKeyVerification::Verified);

        // Same host, other port is a different entry
        assert!(matches!(
            store.verify("box2", 22, &key(KEY_A)),
            HostKeyVerification::Unknown { .. }
        ));

        match store.verify("box1", 22, &key(KEY_B)) {
            HostKeyVerification::Changed {
                expected_fingerprint,
                ..
            } => assert_eq!(expected_fingerprint, KEY_A_FP),
            other => panic!("expected Changed, got {:?}", other),
        }
    }

    const HASHED_10_0_0_5: &str = "|1|dGVybWh1Yi1rbm93bi1ob3N0cy0=|QFbZbUVNqE7ryGpXNhI7VYDujFs=";
    const HASHED_BOX4_2222: &str = "|1|dGVybWh1Yi1rbm93bi1ob3N0cy0=|JVOfucqsO4G4MPNZ6Bfgyhje9Rw=";

    fn store_with(dir: &tempfile::TempDir, content: String) -> KnownHosts {
        let path = dir.path().join("known_hosts");
        fs::write(&path, content).unwrap();
        KnownHosts::load(&path).unwrap()
    }

    #[test]
    fn test_hashed_entries() {
        let dir = tempdir().unwrap();
        let store = store_with(
            &dir,
            format!("{} {}\n{} {}\n", HASHED_10_0_0_5, KEY_A, HASHED_BOX4_2222, KEY_B),
        );

        assert_eq!(store.verify("10.0.0.5", 22, &key(KEY_A)), HostKeyVerification::Verified);
        assert_eq!(store.verify("box4", 2222, &key(KEY_B)), HostKeyVerification::Verified);
        assert!(matches!(
            store.verify("10.0.0.6", 22, &key(KEY_A)),
            HostKeyVerification::Unknown { .. }
        ));

        match store.verify("10.0.0.5", 22, &key(KEY_B)) {
            HostKeyVerification::Changed {
                expected_fingerprint,
                ..
            } => assert_eq!(expected_fingerprint, KEY_A_FP),
            other => panic!("expected Changed, got {:?}", other),
        }
    }

    #[test]
    fn test_revoked_key_is_rejected() {
        let dir = tempdir().unwrap();
        let store = store_with(
            &dir,
            format!("@revoked * {}\nbox1 {}\n@cert-authority *.example.com {}\n", KEY_B, KEY_A, KEY_A),
        );

        assert!(matches!(
            store.verify("box5", 22, &key(KEY_B)),
            HostKeyVerification::Revoked { .. }
        ));
        assert!(matches!(
            store.verify("box1", 22, &key(KEY_B)),
            HostKeyVerification::Revoked { .. }
        ));
        assert_eq!(store.verify("box1", 22, &key(KEY_A)), HostKeyVerification::Verified);
        // Certificate authorities are not host keys
        assert!(matches!(
            store.verify("web.example.com", 22, &key(KEY_A)),
            HostKeyVerification::Unknown { .. }
        ));
    }

    #[test]
    fn test_wildcard_and_negated_patterns() {
        let dir = tempdir().unwrap();
        let store = store_with(&dir, format!("*.lab,!db.lab {}\n", KEY_A));

        assert_eq!(store.verify("web.lab", 22, &key(KEY_A)), HostKeyVerification::Verified);
        assert!(matches!(
            store.verify("web.lab", 22, &key(KEY_B)),
            HostKeyVerification::Changed { .. }
        ));
        assert!(matches!(
            store.verify("db.lab", 22, &key(KEY_B)),
            HostKeyVerification::Unknown { .. }
        ));
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("10.0.0.?", "10.0.0.5"));
        assert!(glob_match("*.example.com", "a.b.example.com"));
        assert!(!glob_match("*.example.com", "example.com"));
        assert!(!glob_match("box?", "box10"));
    }

    #[test]
    fn test_add_host_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".ssh").join("known_hosts");
        let store = KnownHosts::load(&path).unwrap();

        assert!(matches!(
            store.verify("box3", 2200, &key(KEY_B)),
            HostKeyVerification::Unknown { .. }
        ));
        store.add_host("box3", 2200, &key(KEY_B)).unwrap();
        assert_eq!(store.verify("box3", 2200, &key(KEY_B)), HostKeyVerification::Verified);

        let reloaded = KnownHosts::load(&path).unwrap();
        assert_eq!(reloaded.verify("box3", 2200, &key(KEY_B)), HostKeyVerification::Verified);
        assert!(fs::read_to_string(&path).unwrap().starts_with("[box3]:2200 ssh-ed25519 "));
    }
}
