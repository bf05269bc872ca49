use robinmap::RobinMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn test_insert_and_get() {
    let map: RobinMap<u32, String> = RobinMap::new();

    assert!(map.insert(42, "hello".to_string()));
    assert_eq!(map.get(&42), Some("hello".to_string()));
    assert_eq!(map.len(), 1);
}

#[test]
fn test_insert_duplicate_keeps_first_value() {
    let map: RobinMap<u32, String> = RobinMap::new();

    assert!(map.insert(1, "first".to_string()));
    assert!(!map.insert(1, "second".to_string()));
    assert_eq!(map.get(&1), Some("first".to_string()));
    assert_eq!(map.len(), 1);
}

#[test]
fn test_get_missing() {
    let map: RobinMap<u32, String> = RobinMap::new();
    assert_eq!(map.get(&7), None);
    assert!(!map.contains_key(&7));
    assert_eq!(map.count(&7), 0);
}

#[test]
fn test_remove() {
    let map: RobinMap<u32, String> = RobinMap::new();

    map.insert(1, "one".to_string());
    assert!(map.remove(&1));
    assert_eq!(map.get(&1), None);
    assert!(!map.remove(&1));
    assert_eq!(map.len(), 0);
}

#[test]
fn test_contains_and_count_agree_with_get() {
    let map: RobinMap<u32, u32> = RobinMap::new();
    for i in 0..50 {
        map.insert(i, i);
    }
    for i in 0..100 {
        assert_eq!(map.contains_key(&i), map.get(&i).is_some());
        assert_eq!(map.count(&i), usize::from(map.contains_key(&i)));
    }
}

#[test]
fn test_insert_or_assign() {
    let map: RobinMap<u32, String> = RobinMap::new();

    assert!(map.insert_or_assign(1, "a".to_string()));
    assert!(!map.insert_or_assign(1, "b".to_string()));
    assert_eq!(map.get(&1), Some("b".to_string()));
    assert_eq!(map.len(), 1);
}

#[test]
fn test_insert_with_factory_called_only_on_absence() {
    let map: RobinMap<u32, String> = RobinMap::new();
    let calls = AtomicUsize::new(0);

    assert!(map.insert_with(1, || {
        calls.fetch_add(1, Ordering::Relaxed);
        "made".to_string()
    }));
    assert_eq!(calls.load(Ordering::Relaxed), 1);

    assert!(!map.insert_with(1, || {
        calls.fetch_add(1, Ordering::Relaxed);
        "ignored".to_string()
    }));
    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(map.get(&1), Some("made".to_string()));
}

#[test]
fn test_get_or_insert_value() {
    let map: RobinMap<u32, String> = RobinMap::new();

    let v = map.get_or_insert(1, "default".to_string());
    assert_eq!(v, "default");
    assert_eq!(map.len(), 1);
    assert_eq!(map.get(&1), Some("default".to_string()));

    // Present: the stored value wins and nothing is overwritten.
    let v = map.get_or_insert(1, "other".to_string());
    assert_eq!(v, "default");
    assert_eq!(map.len(), 1);
}

#[test]
fn test_get_or_insert_with_factory() {
    let map: RobinMap<u32, String> = RobinMap::new();
    let calls = AtomicUsize::new(0);

    let v = map.get_or_insert_with(1, || {
        calls.fetch_add(1, Ordering::Relaxed);
        "factory".to_string()
    });
    assert_eq!(v, "factory");
    assert_eq!(calls.load(Ordering::Relaxed), 1);

    let v = map.get_or_insert_with(1, || {
        calls.fetch_add(1, Ordering::Relaxed);
        "unused".to_string()
    });
    assert_eq!(v, "factory");
    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(map.len(), 1);
}

#[test]
fn test_many_inserts_roundtrip() {
    let map: RobinMap<u32, String> = RobinMap::new();
    let initial_capacity = map.capacity();

    for i in 0..2000u32 {
        assert!(map.insert(i, i.to_string()));
    }
    assert_eq!(map.len(), 2000);

    for i in 0..2000u32 {
        assert_eq!(map.get(&i), Some(i.to_string()), "key {i} lost");
    }

    // 2000 keys across 64 shards of initial capacity 16 cannot fit at the
    // max load factor without expansions.
    assert!(map.capacity() > initial_capacity);
}

#[test]
fn test_erase_and_reinsert() {
    let map: RobinMap<u32, u32> = RobinMap::new();

    for i in 0..100 {
        map.insert(i, i);
    }
    for i in 0..100 {
        assert!(map.remove(&i));
    }
    for i in 0..100 {
        assert_eq!(map.get(&i), None);
    }
    for i in 0..100 {
        assert!(map.insert(i, i + 1000));
    }
    for i in 0..100 {
        assert_eq!(map.get(&i), Some(i + 1000));
    }
}

#[test]
fn test_clear() {
    let map: RobinMap<u32, String> = RobinMap::new();

    for i in 0..500 {
        map.insert(i, i.to_string());
    }
    assert_eq!(map.len(), 500);

    map.clear();
    assert!(map.is_empty());
    for i in 0..500 {
        assert_eq!(map.get(&i), None);
    }

    // Still usable after clear.
    assert!(map.insert(1, "back".to_string()));
    assert_eq!(map.get(&1), Some("back".to_string()));
}

#[test]
fn test_reserve_avoids_resizes() {
    let map: RobinMap<u32, u32> = RobinMap::new();

    map.reserve(10_000);
    let reserved = map.capacity();

    for i in 0..5_000 {
        map.insert(i, i);
    }
    assert_eq!(map.capacity(), reserved, "inserts resized after reserve");
    assert_eq!(map.len(), 5_000);
}

#[test]
fn test_with_capacity() {
    let map: RobinMap<u32, u32> = RobinMap::with_capacity(10_000);
    let initial = map.capacity();

    for i in 0..5_000 {
        map.insert(i, i);
    }
    assert_eq!(map.capacity(), initial);
}

#[test]
fn test_shard_loads_and_stats() {
    let map: RobinMap<u32, u32> = RobinMap::new();
    for i in 0..2000 {
        map.insert(i, i);
    }

    let loads = map.shard_loads();
    assert_eq!(loads.len(), 64);
    assert_eq!(loads.iter().sum::<usize>(), 2000);

    let stats = map.stats();
    assert_eq!(stats.size, 2000);
    assert_eq!(stats.shard_capacities.len(), 64);
    assert!(stats.shard_capacities.iter().all(|&c| c >= 16));
}

#[test]
fn test_string_keys() {
    let map: RobinMap<String, Vec<u8>> = RobinMap::new();

    map.insert("alpha".to_string(), vec![1, 2, 3]);
    map.insert("beta".to_string(), vec![4, 5]);

    assert_eq!(map.get(&"alpha".to_string()), Some(vec![1, 2, 3]));
    assert_eq!(map.get(&"beta".to_string()), Some(vec![4, 5]));
    assert!(map.remove(&"alpha".to_string()));
    assert_eq!(map.get(&"alpha".to_string()), None);
}
