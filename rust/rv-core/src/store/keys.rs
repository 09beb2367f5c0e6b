// rust/rv-core/src/store/keys.rs

//! Well-known record keys.

/// Head's published connection string.
pub const ADDRESS: &str = "address";

/// Requeue attempt of the head that published `address`.
pub const ATTEMPT: &str = "attempt";

/// Completion sentinel published by the head.
pub const DONE: &str = "done";

/// Literal value of the completion record.
pub const DONE_SENTINEL: &str = "done";

/// Membership marker written by a node once it has joined.
pub fn node(rank: usize) -> String {
    format!("node.{rank}")
}

/// Worker acknowledgement that it observed the completion record.
pub fn ack(rank: usize) -> String {
    format!("ack.{rank}")
}

/// One rank's contribution to an all-gather round of a collective session.
pub fn gather(session: &str, round: u64, rank: usize) -> String {
    format!("gather.{session}.{round}.{rank}")
}

/// One rank's arrival at a barrier round of a collective session.
pub fn barrier(session: &str, round: u64, rank: usize) -> String {
    format!("barrier.{session}.{round}.{rank}")
}

/// Fresh nonce a non-zero rank offers when it opens a collective session.
pub fn collective_join(rank: usize) -> String {
    format!("collective.join.{rank}")
}

/// Rank 0's answer to a join: `<nonce> <session>`.
pub fn collective_welcome(rank: usize) -> String {
    format!("collective.welcome.{rank}")
}

/// Written by a rank once it has entered `session`.
pub fn collective_ready(session: &str, rank: usize) -> String {
    format!("collective.ready.{session}.{rank}")
}

/// Session a per-session collective record belongs to, if `key` is one.
pub fn collective_session(key: &str) -> Option<&str> {
    let rest = key
        .strip_prefix("gather.")
        .or_else(|| key.strip_prefix("barrier."))
        .or_else(|| key.strip_prefix("collective.ready."))?;
    rest.split('.').next()
}

/// Returns true if `key` identifies the head of an attempt (`address` or
/// `attempt`). A head restarting within its own attempt keeps these so a
/// second live head can still be detected; everything else is cleared.
pub fn is_head_record(key: &str) -> bool {
    key == ADDRESS || key == ATTEMPT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        assert_eq!(node(3), "node.3");
        assert_eq!(ack(1), "ack.1");
        assert_eq!(gather("s1", 2, 5), "gather.s1.2.5");
        assert_eq!(barrier("s1", 0, 0), "barrier.s1.0.0");
        assert_eq!(collective_join(2), "collective.join.2");
        assert_eq!(collective_welcome(2), "collective.welcome.2");
        assert_eq!(collective_ready("s1", 2), "collective.ready.s1.2");
    }

    #[test]
    fn test_collective_session() {
        assert_eq!(collective_session("gather.s1.2.5"), Some("s1"));
        assert_eq!(collective_session("barrier.s2.0.0"), Some("s2"));
        assert_eq!(collective_session("collective.ready.s3.1"), Some("s3"));
        assert_eq!(collective_session("collective.join.1"), None);
        assert_eq!(collective_session("node.1"), None);
    }

    #[test]
    fn test_head_records() {
        assert!(is_head_record("address"));
        assert!(is_head_record("attempt"));
        assert!(!is_head_record("done"));
        assert!(!is_head_record("node.4"));
        assert!(!is_head_record("ack.1"));
    }
}
