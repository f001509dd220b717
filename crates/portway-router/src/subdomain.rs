//! Subdomain generation and validation

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashSet;
use thiserror::Error;

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brave", "bright", "calm", "clever", "cosmic", "crisp", "daring", "eager",
    "fancy", "fluffy", "gentle", "giant", "golden", "happy", "hidden", "humble", "icy", "jolly",
    "keen", "lively", "lucky", "mellow", "mighty", "misty", "noble", "polite", "proud", "quick",
    "quiet", "rapid", "rustic", "shiny", "silent", "silver", "sleek", "snowy", "solar", "sunny",
    "swift", "tidy", "vivid", "wild", "witty", "young", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "beacon", "breeze", "canyon", "cedar", "comet", "coral", "cricket", "delta",
    "dolphin", "falcon", "fern", "forest", "fox", "glacier", "harbor", "hawk", "heron", "island",
    "lagoon", "lantern", "maple", "meadow", "meteor", "moon", "nebula", "otter", "owl", "panda",
    "pebble", "pine", "planet", "quartz", "raven", "reef", "river", "rocket", "sparrow", "spruce",
    "summit", "thunder", "tiger", "valley", "walrus", "willow", "wolf", "zephyr",
];

const DEFAULT_RESERVED: &[&str] = &[
    "www", "api", "admin", "app", "dashboard", "mail", "smtp", "ftp", "ssh", "ns1", "ns2", "dns",
    "status", "docs", "help", "support", "billing", "auth", "login", "static", "assets", "cdn",
    "relay", "tunnel", "localhost",
];

/// Why a subdomain was rejected
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubdomainError {
    #[error("Subdomain cannot be empty")]
    Empty,

    #[error("Subdomain too short (minimum {min} characters)")]
    TooShort { min: usize },

    #[error("Subdomain too long (maximum {max} characters)")]
    TooLong { max: usize },

    #[error("Subdomain contains invalid character '{0}' (only a-z, 0-9 and '-' allowed)")]
    InvalidCharacter(char),

    #[error("Subdomain cannot start or end with '-'")]
    EdgeHyphen,

    #[error("Subdomain '{0}' is reserved")]
    Reserved(String),
}

/// Generates readable `adjective-noun-number` subdomains and validates
/// caller-supplied ones
#[derive(Debug, Clone)]
pub struct SubdomainAllocator {
    min_len: usize,
    max_len: usize,
    reserved: HashSet<String>,
}

impl Default for SubdomainAllocator {
    fn default() -> Self {
        Self {
            min_len: 3,
            max_len: 63,
            reserved: DEFAULT_RESERVED.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SubdomainAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add extra reserved labels (normalized to lowercase)
    pub fn with_reserved<I, S>(mut self, words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.reserved
            .extend(words.into_iter().map(|w| w.as_ref().trim().to_lowercase()));
        self
    }

    pub fn is_reserved(&self, subdomain: &str) -> bool {
        self.reserved.contains(subdomain)
    }

    /// Random candidate; uniqueness is up to the caller
    pub fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quick");
        let noun = NOUNS.choose(&mut rng).copied().unwrap_or("fox");
        let number: u16 = rng.gen_range(0..1000);
        format!("{}-{}-{}", adjective, noun, number)
    }

    /// Normalize (trim, lowercase) and check a candidate
    ///
    /// Returns the normalized form on success.
    pub fn validate(&self, candidate: &str) -> Result<String, SubdomainError> {
        let subdomain = candidate.trim().to_lowercase();

        if subdomain.is_empty() {
            return Err(SubdomainError::Empty);
        }
        if subdomain.len() < self.min_len {
            return Err(SubdomainError::TooShort { min: self.min_len });
        }
        if subdomain.len() > self.max_len {
            return Err(SubdomainError::TooLong { max: self.max_len });
        }
        if let Some(bad) = subdomain
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
        {
            return Err(SubdomainError::InvalidCharacter(bad));
        }
        if subdomain.starts_with('-') || subdomain.ends_with('-') {
            return Err(SubdomainError::EdgeHyphen);
        }
        if self.is_reserved(&subdomain) {
            return Err(SubdomainError::Reserved(subdomain));
        }

        Ok(subdomain)
    }
}
