/// Number of characters in a public handle.
pub const HANDLE_LEN: usize = 8;

/// Alphabet used when minting new handles. Ambiguous glyphs (0/O, 1/I) are
/// left out so handles survive being read aloud.
pub const HANDLE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// ChaCha20-Poly1305 nonce size in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Poly1305 tag size in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// Symmetric key size in bytes (256 bits)
pub const SYMMETRIC_KEY_SIZE: usize = 32;

/// X25519 / Ed25519 public key size in bytes
pub const PUBKEY_SIZE: usize = 32;

/// Width of a retrieval bucket: 10 days in milliseconds.
pub const BUCKET_WINDOW_MS: i64 = 10 * 24 * 60 * 60 * 1000;

/// One-time pre-keys minted with a fresh identity.
pub const ONE_TIME_PREKEY_POOL: usize = 20;

/// Largest forward jump a receiving chain takes to reach a payload. The keys
/// stepped over are discarded, not cached.
pub const MAX_CHAIN_GAP: u32 = 1000;

/// Key derivation labels (HKDF info / HMAC input). Every purpose has its own
/// literal so no two derivation contexts collide.
pub const LABEL_X3DH: &[u8] = b"murmur x3dh v1";
pub const LABEL_FALLBACK: &[u8] = b"murmur handle fallback v1";
pub const LABEL_FALLBACK_RATCHET: &[u8] = b"fallback ratchet key";
pub const LABEL_ROOT_KEY: &[u8] = b"root key";
pub const LABEL_SENDING_CHAIN: &[u8] = b"sending chain";
pub const LABEL_RECEIVING_CHAIN: &[u8] = b"receiving chain";
pub const LABEL_MESSAGE_KEY: &[u8] = b"message key";
pub const LABEL_NEXT_CHAIN_KEY: &[u8] = b"next chain key";
pub const LABEL_INITIAL_SEND: &[u8] = b"initial send";
pub const LABEL_INITIAL_RECEIVE: &[u8] = b"initial receive";

/// BLAKE3 derive-key contexts for local-at-rest sealing.
pub const KDF_CONTEXT_STORAGE_KEY: &str = "murmur-storage-key-v1";

/// Schema version written in front of every serialized ratchet snapshot.
pub const RATCHET_SCHEMA_VERSION: u8 = 1;

/// Schema version of sealed identity blobs.
pub const IDENTITY_SCHEMA_VERSION: u8 = 1;

/// Placeholder written to the plaintext column of every durable message row.
pub const SCRUBBED_SENTINEL: &str = "\u{2022}encrypted\u{2022}";

/// Placeholder shown for a message whose ciphertext could not be opened.
pub const UNREADABLE_PLACEHOLDER: &str = "[message unreadable]";
