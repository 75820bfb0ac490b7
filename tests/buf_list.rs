use buflist::{page_size, BufError, BufList, BufPtr, RawBuf};
use proptest::prelude::*;

#[test]
fn concatenation_matches_segment_order() {
    let mut list = BufList::new();
    list.append_slice(b"one ");
    list.append(BufPtr::from_static(b"two "));
    list.append(BufPtr::from(b"three".to_vec()));
    assert_eq!(list.len(), 13);
    assert_eq!(list.to_vec(), b"one two three");
    assert_eq!(list.segments().len(), 3);
}

#[test]
fn zero_length_segments_are_dropped() {
    let mut list = BufList::new();
    list.append(BufPtr::new(0));
    list.append_slice(b"");
    assert!(list.is_empty());
    assert_eq!(list.segments().len(), 0);
}

#[test]
fn appending_shares_storage() {
    let ptr = BufPtr::copy_from(b"shared");
    let mut list = BufList::new();
    list.append(ptr.clone());
    assert_eq!(ptr.ref_count(), 2);
    assert_eq!(list.segments()[0].as_ptr(), ptr.as_ptr());
}

#[test]
fn extend_appends_in_order() {
    let mut list = BufList::new();
    list.extend([BufPtr::copy_from(b"a"), BufPtr::copy_from(b"bc")]);
    assert_eq!(list.to_vec(), b"abc");
}

fn conforming(ptr: &BufPtr) -> bool {
    ptr.is_page_aligned() && ptr.is_n_page_sized()
}

#[test]
fn rebuild_consolidates_unaligned_runs() {
    let page = page_size();
    let mut list = BufList::new();
    // page-sized but at a heap address: needs consolidation, ends the run on
    // a page boundary
    list.append_slice(&vec![7u8; page]);
    let aligned = BufPtr::from_raw(RawBuf::create_page_aligned(page));
    let aligned_addr = aligned.as_ptr();
    list.append(aligned);
    list.append_slice(b"tail");
    let flat = list.to_vec();

    list.rebuild_page_aligned();

    assert_eq!(list.to_vec(), flat);
    assert_eq!(list.len(), flat.len());
    // one consolidated run, the untouched aligned segment, one remainder
    assert_eq!(list.segments().len(), 3);
    assert!(list.segments().iter().all(|p| p.is_page_aligned()));
    // the conforming segment was preserved as a zero-copy share
    assert_eq!(list.segments()[1].as_ptr(), aligned_addr);
    assert!(conforming(&list.segments()[1]));
    // only the final segment may be less than a whole page
    for seg in &list.segments()[..list.segments().len() - 1] {
        assert!(seg.is_n_page_sized());
    }
}

// a conforming segment reached at an unaligned running offset cannot be kept:
// the run swallows it so the consolidated bytes stay contiguous
#[test]
fn rebuild_consumes_conforming_segment_at_odd_offset() {
    let page = page_size();
    let mut list = BufList::new();
    list.append_slice(b"skew!");
    list.append(BufPtr::from_raw(RawBuf::create_page_aligned(page)));
    list.append_slice(&vec![9u8; 7]);
    let flat = list.to_vec();

    list.rebuild_page_aligned();

    assert_eq!(list.segments().len(), 1);
    assert_eq!(list.segments()[0].len(), page + 12);
    assert!(list.segments()[0].is_page_aligned());
    assert_eq!(list.to_vec(), flat);
}

#[test]
fn rebuild_is_idempotent() {
    let mut list = BufList::new();
    list.append_slice(&vec![1u8; 10]);
    list.append_slice(&vec![2u8; page_size() + 3]);
    list.append_slice(&vec![3u8; 77]);
    let flat = list.to_vec();

    list.rebuild_page_aligned();
    let shape: Vec<(usize, bool, bool)> = list
        .segments()
        .iter()
        .map(|p| (p.len(), p.is_page_aligned(), p.is_n_page_sized()))
        .collect();

    list.rebuild_page_aligned();
    let shape2: Vec<(usize, bool, bool)> = list
        .segments()
        .iter()
        .map(|p| (p.len(), p.is_page_aligned(), p.is_n_page_sized()))
        .collect();

    assert_eq!(shape, shape2);
    assert_eq!(list.to_vec(), flat);
}

#[test]
fn rebuild_leaves_conforming_lists_untouched() {
    let page = page_size();
    let mut list = BufList::new();
    for _ in 0..3 {
        list.append(BufPtr::from_raw(RawBuf::create_page_aligned(page)));
    }
    let addrs: Vec<_> = list.segments().iter().map(|p| p.as_ptr()).collect();
    list.rebuild_page_aligned();
    let addrs2: Vec<_> = list.segments().iter().map(|p| p.as_ptr()).collect();
    assert_eq!(addrs, addrs2);
}

#[test]
fn base64_round_trip() {
    for len in [0usize, 1, 2, 3, 4, 57, 100, 4096] {
        let payload: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
        let mut list = BufList::new();
        // split across segments to exercise flattening
        let mid = len / 2;
        list.append_slice(&payload[..mid]);
        list.append_slice(&payload[mid..]);

        let mut encoded = BufList::new();
        list.encode_base64(&mut encoded);

        let mut decoded = BufList::new();
        decoded.decode_base64(&encoded).unwrap();
        assert_eq!(decoded.to_vec(), payload, "len={len}");
    }
}

#[test]
fn base64_decode_rejects_malformed_input() {
    let mut encoded = BufList::new();
    encoded.append_slice(b"not*base64*at*all");
    let mut out = BufList::new();
    out.append_slice(b"existing");
    let err = out.decode_base64(&encoded).unwrap_err();
    match &err {
        BufError::Malformed { dump } => {
            assert!(dump.contains("6e 6f 74"), "dump: {dump}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.errno().is_none());
    // no partial buffer was appended
    assert_eq!(out.to_vec(), b"existing");
}

#[test]
fn hexdump_format() {
    let mut list = BufList::new();
    list.append_slice(b"ABC\x00");
    let expected = concat!(
        "0000 : 41 42 43 00",
        "                                    ",
        " : ABC.\n",
    );
    assert_eq!(list.hexdump(), expected);
}

#[test]
fn hexdump_spans_rows() {
    let mut list = BufList::new();
    list.append_slice(&[0xffu8; 17]);
    let dump = list.hexdump();
    let lines: Vec<&str> = dump.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].starts_with("0000 : ff ff"));
    assert!(lines[1].starts_with("0010 : ff"));
    assert!(lines[0].ends_with(" : ................"));
}

proptest! {
    #[test]
    fn flatten_equals_concatenation(chunks in proptest::collection::vec(
        proptest::collection::vec(any::<u8>(), 0..64),
        0..16,
    )) {
        let mut list = BufList::new();
        for chunk in &chunks {
            list.append_slice(chunk);
        }
        let expected: Vec<u8> = chunks.concat();
        prop_assert_eq!(list.len(), expected.len());
        prop_assert_eq!(list.to_vec(), expected);
        let sum: usize = list.segments().iter().map(|p| p.len()).sum();
        prop_assert_eq!(list.len(), sum);
    }

    #[test]
    fn rebuild_preserves_bytes(chunks in proptest::collection::vec(
        proptest::collection::vec(any::<u8>(), 0..512),
        1..8,
    )) {
        let mut list = BufList::new();
        for chunk in &chunks {
            list.append_slice(chunk);
        }
        let flat = list.to_vec();
        list.rebuild_page_aligned();
        prop_assert_eq!(list.to_vec(), flat);
        prop_assert!(list.segments().iter().all(|p| !p.is_empty()));
        prop_assert!(list.segments().iter().all(|p| p.is_page_aligned()));
    }
}
