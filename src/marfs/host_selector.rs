//! Host Selector — per-open randomized endpoint selection over a templated
//! host range.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::marfs::config::Repository;

/// Per-handle RNG seed, drawn once at `open` and carried for the lifetime
/// of the handle.
pub fn new_seed() -> u64 {
    let mut seed_rng = rand::thread_rng();
    seed_rng.gen()
}

/// Render `repo.host_template`'s single `%d` placeholder with
/// `host_offset + (rand(seed) mod host_count)`. `host_count == 1` disables
/// randomization and always selects `host_offset`.
pub fn select_host(repo: &Repository, seed: u64) -> String {
    let index = if repo.host_count <= 1 {
        0
    } else {
        let mut rng = StdRng::seed_from_u64(seed);
        rng.gen_range(0..repo.host_count)
    };
    let host_no = repo.host_offset + index;
    repo.host_template.replacen("%d", &host_no.to_string(), 1)
}

/// Build the full object URL for a host, bucket, and object id.
pub fn object_url(repo: &Repository, host: &str, object_id: &str) -> String {
    let scheme = if repo.tls { "https" } else { "http" };
    format!("{scheme}://{host}/{}/{}", repo.bucket, object_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marfs::config::AccessMethod;

    fn repo(host_count: u32) -> Repository {
        Repository {
            name: "repo1".to_string(),
            access_method: AccessMethod::S3,
            host_template: "10.0.0.%d".to_string(),
            host_offset: 1,
            host_count,
            bucket: "marfs-repo1".to_string(),
            tls: true,
            chunk_size: 1 << 20,
        }
    }

    #[test]
    fn single_host_disables_randomization() {
        let r = repo(1);
        assert_eq!(select_host(&r, 12345), "10.0.0.1");
        assert_eq!(select_host(&r, 99999), "10.0.0.1");
    }

    #[test]
    fn multi_host_stays_within_range() {
        let r = repo(4);
        for seed in 0..50u64 {
            let host = select_host(&r, seed);
            let n: u32 = host.strip_prefix("10.0.0.").unwrap().parse().unwrap();
            assert!((1..=4).contains(&n));
        }
    }

    #[test]
    fn object_url_uses_tls_scheme() {
        let r = repo(1);
        assert_eq!(
            object_url(&r, "10.0.0.1", "42-0"),
            "https://10.0.0.1/marfs-repo1/42-0"
        );
    }
}
