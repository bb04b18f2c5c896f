extern crate fray;

use fray::utils::prelude::*;

#[test]
fn handle_set() {
    let mut set: HandlePool<Handle> = HandlePool::new();
    assert_eq!(set.len(), 0);

    let e1 = set.create();
    assert!(e1.is_valid());
    assert!(set.contains(e1));
    assert_eq!(set.len(), 1);

    let mut e2 = e1;
    assert!(set.contains(e2));
    assert_eq!(set.len(), 1);

    // Invalidated copies stop matching, the original stays alive.
    e2.invalidate();
    assert!(!e2.is_valid());
    assert!(!set.contains(e2));
    assert!(set.contains(e1));

    let e2 = e1;
    set.free(e2);
    assert!(!set.contains(e2));
    assert!(!set.contains(e1));
    assert_eq!(set.len(), 0);
}

#[test]
fn index_reuse() {
    let mut set: HandlePool<Handle> = HandlePool::new();
    assert_eq!(set.len(), 0);

    let mut v = vec![];
    for _ in 0..10 {
        v.push(set.create());
    }

    assert_eq!(set.len(), 10);
    for e in v.iter().take(5) {
        set.free(*e);
    }

    // Freed indices come back smallest-first, with fresh generations.
    for i in 0..10 {
        let e = set.create();
        let expected = if i < 5 { i } else { 5 + i };
        assert_eq!(e.index() as usize, expected);
        assert!(!v.contains(&e));
    }

    assert_eq!(set.len(), 15);
}

#[test]
fn iteration_skips_dead_slots() {
    let mut set: HandlePool<Handle> = HandlePool::new();
    let handles: Vec<Handle> = (0..8).map(|_| set.create()).collect();

    for e in handles.iter().filter(|e| e.index() % 2 == 1) {
        set.free(*e);
    }

    let alive: Vec<Handle> = set.iter().collect();
    assert_eq!(alive.len(), 4);
    for e in alive {
        assert_eq!(e.index() % 2, 0);
        assert!(set.contains(e));
    }
}
