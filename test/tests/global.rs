//! Smoke tests for the `Segfit` global allocator front end: the whole test
//! binary allocates out of the static scratch arena.

use std::collections::HashMap;
use std::thread;

#[global_allocator]
static A: segfit::Segfit = segfit::Segfit::INIT;

#[test]
fn map() {
    let mut m = HashMap::new();
    m.insert(1, 2);
    m.insert(5, 3);
    assert_eq!(m.get(&1), Some(&2));
    drop(m);
}

#[test]
fn strings() {
    let s = format!("foo, bar, {}", "baz");
    assert_eq!(s, "foo, bar, baz");
}

#[test]
fn vec_growth() {
    let mut v = Vec::new();
    for i in 0..100_000u64 {
        v.push(i);
    }
    assert_eq!(v.iter().sum::<u64>(), 100_000 * 99_999 / 2);
    drop(v);

    let mut boxes = Vec::new();
    for i in 0..1_000u32 {
        boxes.push(Box::new(i));
    }
    for (i, b) in boxes.iter().enumerate() {
        assert_eq!(**b, i as u32);
    }
}

#[test]
fn threads() {
    assert!(thread::spawn(|| panic!()).join().is_err());
}

#[test]
fn larger_than_dword_alignment() {
    use std::mem;

    // Align to 32 bytes; this takes the stashed-offset path.
    #[repr(align(32))]
    struct Align32(u8);

    assert_eq!(mem::align_of::<Align32>(), 32);

    for _ in 0..100 {
        let b = Box::new(Align32(42));

        let p = Box::into_raw(b);
        assert_eq!(p as usize % 32, 0, "{:p} should be aligned to 32", p);

        unsafe {
            let b = Box::from_raw(p);
            assert_eq!(b.0, 42);
        }
    }
}
