use interfaces::PostCandidate;

/// True for posts written by the account itself, false for reposts.
///
/// Only decides persistence. Reposts still count toward the seen boundary
/// and still move the watermark.
pub fn is_original(candidate: &PostCandidate) -> bool {
    candidate.reposted.is_none()
}
