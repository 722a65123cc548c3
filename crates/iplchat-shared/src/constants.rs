/// XChaCha20-Poly1305 nonce size in bytes
pub const NONCE_SIZE: usize = 24;

/// Symmetric key size in bytes (XChaCha20-Poly1305)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// Ed25519 signature size in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Serialized public key bundle size: verify key (32) followed by encrypt key (32)
pub const PUBLIC_BUNDLE_SIZE: usize = 64;

/// Salt size for stored password hashes
pub const PASSWORD_SALT_SIZE: usize = 16;

/// Salt size for the client keychain file header
pub const KEYCHAIN_SALT_SIZE: usize = 32;

/// Canonical textual UUID length
pub const UUID_TEXT_LEN: usize = 36;

/// Maximum message ciphertext accepted at envelope construction
pub const MAX_CIPHERTEXT_LEN: usize = 500;

/// Maximum payload of a single framed packet. Sized so a `Message` envelope
/// carrying a full 500-byte ciphertext always fits.
pub const MAX_PACKET_PAYLOAD: usize = 1012;

/// Default broker TCP port
pub const DEFAULT_PORT: u16 = 4589;

/// Channel cache capacity (entries)
pub const CHANNEL_CACHE_CAPACITY: usize = 100;

/// Per-request decay base for channel relevance
pub const RELEVANCE_DECAY_DELTA: f64 = 0.0001;

/// Decay time constant in seconds
pub const RELEVANCE_DECAY_RHO: f64 = 0.1;

/// Relevance weights: subscribers, request count, decay
pub const RELEVANCE_WEIGHT_SUBSCRIBERS: f64 = 0.5;
pub const RELEVANCE_WEIGHT_REQUESTS: f64 = 0.3;
pub const RELEVANCE_WEIGHT_DECAY: f64 = 0.2;

/// Result cap for username substring search
pub const USER_SEARCH_DEPTH: usize = 3;
