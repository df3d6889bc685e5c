/// Compute a stable hash of serialized bytes.
///
/// Uses SeaHash, which is stable across compiler versions, process restarts
/// and machines. The run record stores this fingerprint of its plan so a
/// resumed invocation can detect that it was handed a different plan.
///
/// Not cryptographically secure; only used for equality checks.
pub fn fingerprint(bytes: &[u8]) -> u64 {
    seahash::hash(bytes)
}
