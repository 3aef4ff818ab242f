// src/ids.rs
//
// String identities for engine objects.

use uuid::Uuid;

pub type TrackId = String;
pub type RegionId = String;
pub type NoteId = String;
pub type EffectId = String;
pub type LaneId = String;
pub type TakeId = String;

/// Generate a `<prefix>-<uuid>` identity.
pub fn generate(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4().simple())
}

/// First eight hex digits of a generated id, used for default names.
pub(crate) fn short(id: &str) -> &str {
    let tail = id.rsplit('-').next().unwrap_or(id);
    match tail.char_indices().nth(8) {
        Some((end, _)) => &tail[..end],
        None => tail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_unique_and_prefixed() {
        let a = generate("track");
        let b = generate("track");
        assert_ne!(a, b);
        assert!(a.starts_with("track-"));
        assert_eq!(short(&a).len(), 8);
    }
}
