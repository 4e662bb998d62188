use sha2::{Digest, Sha256};

/// Length of truncated record ids. 128 bits of sha256 is plenty for
/// collision-resistance within one installation.
const ID_HEX_LEN: usize = 32;

pub fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    format!("{:x}", hasher.finalize())
}

/// Full content hash used for delta detection and cache keys.
pub fn content_hash(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

fn derived_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        // Separator guards against ambiguous concatenations.
        hasher.update([0u8]);
    }
    let mut hex = format!("{:x}", hasher.finalize());
    hex.truncate(ID_HEX_LEN);
    hex
}

/// Stable chunk id: identical file content at identical lines always hashes
/// to the same id across rebuilds.
pub fn chunk_id(
    corpus_id: &str,
    file_path: &str,
    start_line: u32,
    end_line: u32,
    content_hash: &str,
) -> String {
    derived_id(&[
        corpus_id,
        file_path,
        &start_line.to_string(),
        &end_line.to_string(),
        content_hash,
    ])
}

pub fn entity_id(corpus_id: &str, qualified_name: &str, kind: &str) -> String {
    derived_id(&[corpus_id, qualified_name, kind])
}

pub fn relationship_id(source_id: &str, target_id: &str, kind: &str) -> String {
    derived_id(&[source_id, target_id, kind])
}

pub fn community_id(corpus_id: &str, level: u32, member_ids: &[String]) -> String {
    let joined = member_ids.join(",");
    derived_id(&[corpus_id, &level.to_string(), &joined])
}
