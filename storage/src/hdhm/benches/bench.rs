use criterion::criterion_main;
use ledger_storage::hdhm::{Config, HalfDiskHashMap};
use prometheus_client::registry::Registry;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tempfile::TempDir;


criterion_main!(put::benches, get::benches, merge::benches);

/// Expected number of entries in the benchmarked maps.
const MAP_SIZE: u64 = 1_000_000;

/// Open a map (in a fresh temporary directory) sized for [MAP_SIZE] entries.
fn get_map() -> (TempDir, HalfDiskHashMap<u64>) {
    let dir = TempDir::new().unwrap();
    let cfg = Config {
        map_size: MAP_SIZE,
        directory: dir.path().to_path_buf(),
        name: "bench".into(),
    };
    let map = HalfDiskHashMap::init(cfg, &mut Registry::default()).unwrap();
    (dir, map)
}

/// Generate `count` keys deterministically.
fn gen_keys(seed: u64, count: usize) -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count).map(|_| rng.gen()).collect()
}

/// Write `keys` to `map` in sessions of `batch` keys (the value of each key is its position).
fn write_keys(map: &HalfDiskHashMap<u64>, keys: &[u64], batch: usize) {
    for (i, chunk) in keys.chunks(batch).enumerate() {
        map.start_writing().unwrap();
        for (j, key) in chunk.iter().enumerate() {
            map.put(*key, (i * batch + j) as i64).unwrap();
        }
        map.end_writing().unwrap();
    }
}
