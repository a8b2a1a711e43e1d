mod common;

use std::collections::HashSet;
use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use common::*;
use pagesift::hashing::HashAlg;
use pagesift::image::{self, ImageError, ImageSource, PageData, PageGeometry, PageRef};
use pagesift::sbuf::Sbuf;
use pagesift::scanner::{
    self, ScanContext, Scanner, ScannerCommand, ScannerConfig, ScannerError, ScannerInfo,
};

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
fn nested_container_stops_at_max_depth() {
    let inner = stored_entry("inner.txt", &[b'x'; 64]);
    let outer = deflated_entry("outer.zip", &inner);
    let mut data = vec![0u8; 3 * PAGE as usize];
    insert_bytes(&mut data, 0x1000, &outer);

    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("nested.raw");
    fs::write(&input, &data).expect("write input");
    let outdir = dir.path().join("out");

    let mut cfg = test_config();
    cfg.max_depth = 1;
    run_raw(&cfg, &input, &outdir).expect("run");

    let zip = read_features(&outdir, "zip");
    assert_eq!(zip.len(), 2, "{zip:?}");
    assert_eq!(zip[0].0, "4096");
    assert_eq!(zip[0].1, "outer.zip");
    assert!(zip[0].2.contains("decompressed"));
    assert_eq!(zip[1].0, "4096-ZIP-0");
    assert!(zip[1].2.contains("<disposition>max-depth</disposition>"));
    assert!(zip.iter().all(|(pos, _, _)| pos.matches("ZIP").count() < 2));

    let alerts = read_features(&outdir, "alert");
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].0, "4096-ZIP");
    assert_eq!(alerts[0].1, "zip: MAX DEPTH DETECTED");
}

#[test]
fn identical_containers_on_different_pages_are_expanded_once() {
    let entry = deflated_entry("memo.txt", &b"The quick brown fox jumps over the lazy dog. ".repeat(4));
    let mut data = vec![0u8; 6 * PAGE as usize];
    insert_bytes(&mut data, 0x1000, &entry);
    insert_bytes(&mut data, 0x5000, &entry);

    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("twins.raw");
    fs::write(&input, &data).expect("write input");
    let outdir = dir.path().join("out");

    let stats = run_raw(&test_config(), &input, &outdir).expect("run");
    assert_eq!(stats.pages_scheduled, 6);

    let zip = read_features(&outdir, "zip");
    assert_eq!(zip.len(), 2, "{zip:?}");
    let positions: HashSet<&str> = zip.iter().map(|(pos, _, _)| pos.as_str()).collect();
    assert_eq!(positions, HashSet::from(["4096", "20480"]));
    let decompressed = zip.iter().filter(|r| r.2.contains("decompressed")).count();
    let skipped = zip
        .iter()
        .filter(|r| r.2.contains("previously-processed"))
        .count();
    assert_eq!((decompressed, skipped), (1, 1));
}

#[test]
fn sequential_run_hashes_whole_image() {
    let data = patterned(4 * PAGE as usize + 100);
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("plain.raw");
    fs::write(&input, &data).expect("write input");
    let outdir = dir.path().join("out");

    let stats = run_raw(&test_config(), &input, &outdir).expect("run");
    assert_eq!(stats.pages_scheduled, 5);
    assert_eq!(stats.bytes_scheduled, data.len() as u64);
    let expected = HashAlg::Md5.hash_hex(&data);
    assert_eq!(stats.digest.as_deref(), Some(expected.as_str()));

    let report = read_report(&outdir);
    let source = events(&report, "source");
    assert_eq!(source.len(), 1);
    assert_eq!(source[0]["digest"], expected.as_str());
    assert_eq!(source[0]["hash_alg"], "md5");
    assert_eq!(events(&report, "work_start").len(), 5);
    assert_eq!(events(&report, "work_end").len(), 5);
    assert_eq!(events(&report, "run_end").len(), 1);
}

#[test]
fn skipped_pages_leave_no_digest() {
    let data = patterned(4 * PAGE as usize);
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("plain.raw");
    fs::write(&input, &data).expect("write input");

    let mut cfg = test_config();
    cfg.page_start = 1;
    let stats = run_raw(&cfg, &input, &dir.path().join("from_page_1")).expect("run");
    assert_eq!(stats.pages_scheduled, 3);
    assert_eq!(stats.digest, None);

    let mut cfg = test_config();
    cfg.sampling = Some("0.5".to_string());
    cfg.sampling_seed = Some(1);
    let stats = run_raw(&cfg, &input, &dir.path().join("sampled")).expect("run");
    assert_eq!(stats.digest, None);

    let report = read_report(&dir.path().join("sampled"));
    let source = events(&report, "source");
    assert!(source[0].get("digest").is_none_or(|d| d.is_null()));
}

#[test]
fn sampling_schedules_exact_distinct_pages() {
    let data = vec![0u8; 40 * PAGE as usize];
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("sparse.raw");
    fs::write(&input, &data).expect("write input");
    let outdir = dir.path().join("out");

    let mut cfg = test_config();
    cfg.sampling = Some("0.25".to_string());
    cfg.sampling_seed = Some(11);
    let stats = run_raw(&cfg, &input, &outdir).expect("run");
    assert_eq!(stats.pages_scheduled, 10);

    let report = read_report(&outdir);
    let started: HashSet<String> = events(&report, "work_start")
        .iter()
        .map(|e| e["pos"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(started.len(), 10);
}

#[test]
fn offset_window_limits_pages() {
    let data = vec![0u8; 8 * PAGE as usize];
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("window.raw");
    fs::write(&input, &data).expect("write input");
    let outdir = dir.path().join("out");

    let mut cfg = test_config();
    cfg.offset_start = 2 * PAGE;
    cfg.offset_end = 5 * PAGE;
    let stats = run_raw(&cfg, &input, &outdir).expect("run");
    assert_eq!(stats.pages_scheduled, 3);

    let report = read_report(&outdir);
    let mut started: Vec<u64> = events(&report, "work_start")
        .iter()
        .filter_map(|e| e["pos"].as_str()?.parse().ok())
        .collect();
    started.sort_unstable();
    assert_eq!(started, vec![2 * PAGE, 3 * PAGE, 4 * PAGE]);
}

#[test]
fn deny_list_diverts_features() {
    let mut data = vec![0u8; 3 * PAGE as usize];
    insert_bytes(&mut data, 0x100, &stored_entry("keep.txt", &[b'k'; 32]));
    insert_bytes(&mut data, 0x1100, &stored_entry("drop.tmp", &[b'd'; 32]));

    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("lists.raw");
    fs::write(&input, &data).expect("write input");
    let deny = dir.path().join("deny.txt");
    fs::write(&deny, "# temporary files\n*.tmp\n").expect("write deny list");
    let outdir = dir.path().join("out");

    let mut cfg = test_config();
    cfg.deny_list = Some(deny);
    run_raw(&cfg, &input, &outdir).expect("run");

    let kept = read_features(&outdir, "zip");
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].1, "keep.txt");
    let stopped = read_features(&outdir, "zip_stopped");
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].1, "drop.tmp");
}

#[test]
fn directory_image_pages_each_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("evidence");
    fs::create_dir_all(root.join("sub")).expect("mkdir");
    let mut a = vec![0u8; 300];
    insert_bytes(&mut a, 100, &stored_entry("from_a.txt", &[b'a'; 40]));
    fs::write(root.join("a.bin"), &a).expect("write a");
    let mut b = stored_entry("from_b.txt", &[b'b'; 40]);
    b.extend(vec![0u8; 100]);
    fs::write(root.join("sub").join("b.bin"), &b).expect("write b");

    let cfg = test_config();
    let geometry = PageGeometry::new(cfg.page_size, cfg.margin).expect("geometry");
    let image: Arc<dyn ImageSource> =
        Arc::from(image::open_image(&root, geometry).expect("open dir"));
    let outdir = dir.path().join("out");
    let stats = run_with(&cfg, image, &outdir, scanner::builtin_scanners(), &[]).expect("run");
    assert_eq!(stats.pages_scheduled, 2);

    let mut zip = read_features(&outdir, "zip");
    zip.sort();
    let positions: Vec<&str> = zip.iter().map(|(pos, _, _)| pos.as_str()).collect();
    assert_eq!(positions, vec!["a.bin-100", "sub/b.bin-0"]);
}

#[test]
fn unknown_scanner_fails_before_output_is_created() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("tiny.raw");
    fs::write(&input, vec![0u8; 1024]).expect("write input");
    let outdir = dir.path().join("out");

    let cfg = test_config();
    let result = run_with(
        &cfg,
        open_raw(&input, &cfg),
        &outdir,
        scanner::builtin_scanners(),
        &[ScannerCommand::Enable("nope".to_string())],
    );
    assert!(result.is_err());
    assert!(!outdir.exists());
}

/// Panics on the second page.
struct PanickyScanner;

impl Scanner for PanickyScanner {
    fn startup(&mut self, _config: &ScannerConfig) -> ScannerInfo {
        ScannerInfo::new("panicky")
    }

    fn scan(&self, sbuf: &Sbuf<'_>, _ctx: &mut ScanContext<'_>) -> Result<(), ScannerError> {
        if sbuf.page_number == 1 {
            panic!("bad page {}", sbuf.pos0);
        }
        Ok(())
    }
}

#[test]
fn panicking_scanner_only_loses_its_page() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("three.raw");
    fs::write(&input, vec![0u8; 3 * PAGE as usize]).expect("write input");
    let outdir = dir.path().join("out");

    let cfg = test_config();
    let stats = run_with(
        &cfg,
        open_raw(&input, &cfg),
        &outdir,
        vec![Box::new(PanickyScanner)],
        &[],
    )
    .expect("run");
    assert_eq!(stats.pages_scheduled, 3);
    assert_eq!(stats.page_errors, 1);

    let report = read_report(&outdir);
    let exceptions = events(&report, "debug_exception");
    assert_eq!(exceptions.len(), 1);
    assert_eq!(exceptions[0]["pos"], "4096");
    assert!(exceptions[0]["message"]
        .as_str()
        .unwrap_or_default()
        .contains("bad page 4096"));
    assert_eq!(events(&report, "work_end").len(), 3);
}

/// Panics on every nested buffer.
struct NestedPanicScanner;

impl Scanner for NestedPanicScanner {
    fn startup(&mut self, _config: &ScannerConfig) -> ScannerInfo {
        ScannerInfo::new("nested_panic")
    }

    fn scan(&self, sbuf: &Sbuf<'_>, ctx: &mut ScanContext<'_>) -> Result<(), ScannerError> {
        if ctx.depth() >= 1 {
            panic!("nested buffer {}", sbuf.pos0);
        }
        Ok(())
    }
}

#[test]
fn panic_in_nested_buffer_keeps_scanning_the_page() {
    let mut data = vec![0u8; PAGE as usize];
    insert_bytes(&mut data, 0x100, &stored_entry("first.txt", &[b'1'; 40]));
    insert_bytes(&mut data, 0x400, &stored_entry("second.txt", &[b'2'; 40]));

    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("one.raw");
    fs::write(&input, &data).expect("write input");
    let outdir = dir.path().join("out");

    let cfg = test_config();
    let scanners: Vec<Box<dyn Scanner>> = vec![
        Box::new(scanner::zip::ZipScanner::default()),
        Box::new(NestedPanicScanner),
    ];
    let stats = run_with(&cfg, open_raw(&input, &cfg), &outdir, scanners, &[]).expect("run");
    assert_eq!(stats.page_errors, 0);
    assert_eq!(stats.scanner_errors, 2);

    let names: Vec<String> = read_features(&outdir, "zip")
        .into_iter()
        .map(|(_, name, _)| name)
        .collect();
    assert_eq!(names, vec!["first.txt", "second.txt"]);
}

/// Fails the first `failures` page reads with an allocation error.
struct FlakyImage {
    inner: Arc<dyn ImageSource>,
    failures: AtomicU32,
}

impl ImageSource for FlakyImage {
    fn image_size(&self) -> u64 {
        self.inner.image_size()
    }

    fn image_identifier(&self) -> &str {
        self.inner.image_identifier()
    }

    fn page_count(&self) -> u64 {
        self.inner.page_count()
    }

    fn page(&self, index: u64) -> Option<PageRef> {
        self.inner.page(index)
    }

    fn read_page(&self, page: &PageRef) -> Result<PageData, ImageError> {
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(ImageError::OutOfMemory { bytes: 4096 });
        }
        self.inner.read_page(page)
    }
}

fn run_flaky(failures: u32) -> anyhow::Result<pagesift::pipeline::PipelineStats> {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("flaky.raw");
    fs::write(&input, patterned(2 * PAGE as usize)).expect("write input");

    let mut cfg = test_config();
    cfg.max_alloc_retries = 3;
    let image = Arc::new(FlakyImage {
        inner: open_raw(&input, &cfg),
        failures: AtomicU32::new(failures),
    });
    run_with(
        &cfg,
        image,
        &dir.path().join("out"),
        scanner::builtin_scanners(),
        &[],
    )
}

#[test]
fn allocation_failures_are_retried_within_budget() {
    let stats = run_flaky(3).expect("run");
    assert_eq!(stats.alloc_retries, 3);
    assert_eq!(stats.pages_scheduled, 2);
    assert!(stats.digest.is_some());
}

#[test]
fn allocation_failures_past_budget_are_fatal() {
    let err = run_flaky(4).expect_err("memory exhausted");
    assert!(format!("{err:#}").contains("memory exhausted"));
}
