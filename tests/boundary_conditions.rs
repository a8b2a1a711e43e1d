mod common;

use std::fs;

use common::*;
use pagesift::hashing::HashAlg;

#[test]
fn member_crossing_page_boundary_is_read_through_margin() {
    let entry = stored_entry("spans.txt", &[b's'; 120]);
    let start = PAGE as usize - 50;
    let mut data = vec![0u8; 2 * PAGE as usize];
    insert_bytes(&mut data, start, &entry);

    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("span.raw");
    fs::write(&input, &data).expect("write input");
    let outdir = dir.path().join("out");
    run_raw(&test_config(), &input, &outdir).expect("run");

    let zip = read_features(&outdir, "zip");
    assert_eq!(zip.len(), 1);
    assert_eq!(zip[0].0, start.to_string());
    assert!(zip[0].2.contains("<disposition>stored</disposition>"));
}

#[test]
fn header_in_margin_belongs_to_next_page() {
    let entry = stored_entry("next.txt", &[b'n'; 40]);
    let mut data = vec![0u8; 2 * PAGE as usize];
    insert_bytes(&mut data, PAGE as usize + 8, &entry);

    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("margin.raw");
    fs::write(&input, &data).expect("write input");
    let outdir = dir.path().join("out");
    run_raw(&test_config(), &input, &outdir).expect("run");

    let zip = read_features(&outdir, "zip");
    assert_eq!(zip.len(), 1);
    assert_eq!(zip[0].0, (PAGE + 8).to_string());
}

#[test]
fn empty_image_runs_cleanly() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("empty.raw");
    fs::write(&input, b"").expect("write input");
    let outdir = dir.path().join("out");

    let stats = run_raw(&test_config(), &input, &outdir).expect("run");
    assert_eq!(stats.pages_scheduled, 0);
    assert_eq!(stats.digest, Some(HashAlg::Md5.hash_hex(b"")));
    assert!(read_features(&outdir, "zip").is_empty());
    let report = read_report(&outdir);
    assert_eq!(events(&report, "run_end").len(), 1);
}

#[test]
fn many_pages_many_workers() {
    let pages = 64usize;
    let mut data = vec![0u8; pages * PAGE as usize];
    for page in 0..pages {
        let entry = stored_entry(&format!("p{page:03}.txt"), format!("{page:08}").repeat(4).as_bytes());
        insert_bytes(&mut data, page * PAGE as usize + 16, &entry);
    }

    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("many.raw");
    fs::write(&input, &data).expect("write input");
    let outdir = dir.path().join("out");

    let mut cfg = test_config();
    cfg.threads = 4;
    let stats = run_raw(&cfg, &input, &outdir).expect("run");
    assert_eq!(stats.pages_scheduled, pages as u64);
    assert!(stats.drained);
    assert_eq!(stats.worker_wait_secs.len(), 4);
    assert_eq!(read_features(&outdir, "zip").len(), pages);
    assert!(stats
        .feature_counts
        .iter()
        .any(|(name, count)| name == "zip" && *count == pages as u64));
}
