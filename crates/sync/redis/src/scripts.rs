//! Server-side Lua scripts.
//!
//! Each lock mutation is a single `EVAL` so the test-and-set happens in one
//! server-side evaluation; `owned` also compares server-side to avoid a
//! get-then-compare window.

/// Claim the key for the token unless a live foreign holder exists.
///
/// KEYS[1] = lock key, ARGV[1] = token, ARGV[2] = TTL in milliseconds.
pub const ACQUIRE: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 or redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
    return 1
else
    return 0
end
";

/// Delete the key iff the token still holds it.
///
/// KEYS[1] = lock key, ARGV[1] = token.
pub const RELEASE: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
else
    return 0
end
";

/// Whether the key is currently held by the token.
///
/// KEYS[1] = lock key, ARGV[1] = token.
pub const OWNED: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return 1
else
    return 0
end
";
