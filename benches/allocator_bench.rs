//! Caching Allocator Benchmark Suite
//!
//! Measures the host-side cost of the caching allocator on the simulated
//! driver:
//! - Cache hits (same size freed and reallocated)
//! - Cache misses (eager release forces a native allocation every time)
//! - Mixed sizes that split and merge segments
//! - Stream pool round-robin
//!
//! Run with: `cargo bench --bench allocator_bench`

use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

use npuforge::allocator::{AllocatorConfig, NpuAllocator, ReleasePolicy};
use npuforge::{NpuCachingAllocator, SimDriver};
use npuforge::{DeviceRegistry, StreamPool};

const GIB: usize = 1 << 30;

struct Benchmark {
    name: String,
    iterations: usize,
    durations: Vec<Duration>,
}

impl Benchmark {
    fn new(name: &str, iterations: usize) -> Self {
        Benchmark {
            name: name.to_string(),
            iterations,
            durations: Vec::with_capacity(iterations),
        }
    }

    fn run<F: FnMut()>(&mut self, mut f: F) {
        // Warmup
        for _ in 0..self.iterations.min(16) {
            f();
        }
        for _ in 0..self.iterations {
            let start = Instant::now();
            f();
            self.durations.push(start.elapsed());
        }
    }

    fn report(&mut self) {
        self.durations.sort();
        let total: Duration = self.durations.iter().sum();
        let avg = total / self.durations.len().max(1) as u32;
        let pct = |p: f64| self.durations[((self.durations.len() - 1) as f64 * p) as usize];

        println!("\n=== {} ===", self.name);
        println!("Iterations: {}", self.iterations);
        println!("Average: {:?}", avg);
        println!("P50:     {:?}", pct(0.50));
        println!("P95:     {:?}", pct(0.95));
        println!("P99:     {:?}", pct(0.99));
    }
}

fn make_allocator(config: AllocatorConfig) -> (Arc<NpuCachingAllocator>, Arc<StreamPool>) {
    let driver = Arc::new(SimDriver::new(1, 8 * GIB));
    let registry = Arc::new(DeviceRegistry::new(driver));
    let streams = Arc::new(StreamPool::new(registry.clone()));
    let allocator = Arc::new(NpuCachingAllocator::new(registry, streams.clone(), config));
    allocator.init(1).expect("allocator init");
    (allocator, streams)
}

fn benchmark_cache_hit() {
    let (allocator, streams) = make_allocator(AllocatorConfig::default());
    let stream = streams.default_stream(Some(0)).expect("default stream");

    for size in [4096usize, 512 * 1024, 8 << 20, 64 << 20] {
        let mut bench = Benchmark::new(&format!("cache hit, {} bytes", size), 10_000);
        bench.run(|| {
            let ptr = allocator.raw_alloc_with_stream(size, &stream).expect("alloc");
            allocator.raw_delete(black_box(ptr)).expect("free");
        });
        bench.report();
    }
}

fn benchmark_cache_miss() {
    let config = AllocatorConfig::new().with_release_policy(ReleasePolicy::Eager);
    let (allocator, streams) = make_allocator(config);
    let stream = streams.default_stream(Some(0)).expect("default stream");

    for size in [4096usize, 8 << 20, 64 << 20] {
        let mut bench = Benchmark::new(&format!("cache miss, {} bytes", size), 10_000);
        bench.run(|| {
            let ptr = allocator.raw_alloc_with_stream(size, &stream).expect("alloc");
            allocator.raw_delete(black_box(ptr)).expect("free");
        });
        bench.report();
    }
}

fn benchmark_split_and_merge() {
    let (allocator, streams) = make_allocator(AllocatorConfig::default());
    let stream = streams.default_stream(Some(0)).expect("default stream");
    let sizes = [512usize, 3000, 70_000, 300_000, 1 << 20, 3 << 20, 9 << 20];

    let mut bench = Benchmark::new("mixed sizes, 64 live blocks", 1_000);
    bench.run(|| {
        let mut live = Vec::with_capacity(64);
        for i in 0..64 {
            let size = sizes[i % sizes.len()];
            live.push(allocator.raw_alloc_with_stream(size, &stream).expect("alloc"));
        }
        // Free every other block first to force merges out of order
        for ptr in live.iter().step_by(2) {
            allocator.raw_delete(*ptr).expect("free");
        }
        for ptr in live.iter().skip(1).step_by(2) {
            allocator.raw_delete(*ptr).expect("free");
        }
    });
    bench.report();

    let stats = allocator.device_stats(0).expect("stats");
    println!(
        "  Reserved after run: {} bytes in {} segment(s)",
        stats.reserved_bytes.all.current, stats.segment.all.current
    );
}

fn benchmark_stream_pool() {
    let (_allocator, streams) = make_allocator(AllocatorConfig::default());

    let mut bench = Benchmark::new("stream_from_pool", 100_000);
    bench.run(|| {
        black_box(streams.stream_from_pool(false, Some(0)).expect("pool stream"));
    });
    bench.report();
}

fn main() {
    println!("====================================");
    println!("NpuForge Allocator Benchmark Suite");
    println!("====================================");

    benchmark_cache_hit();
    benchmark_cache_miss();
    benchmark_split_and_merge();
    benchmark_stream_pool();
}
