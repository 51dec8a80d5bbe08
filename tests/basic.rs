use triemap_rs::{CopyError, Mapper};

const SAMPLE: [(i32, i32); 64] = [
    (24074, 11156),
    (22731, 17638),
    (17336, 6935),
    (8212, 22342),
    (29837, 9789),
    (14312, 16209),
    (29097, 23526),
    (20631, 31667),
    (2752, 14885),
    (25359, 30225),
    (4583, 17329),
    (26648, 28111),
    (6948, 32130),
    (498, 4487),
    (31105, 6313),
    (26398, 16772),
    (3644, 32520),
    (25228, 5511),
    (10169, 23587),
    (8148, 15974),
    (20480, 4628),
    (8739, 18591),
    (28713, 22060),
    (18476, 21862),
    (6821, 24167),
    (7038, 10563),
    (7570, 20101),
    (7718, 32320),
    (28587, 25902),
    (13350, 31552),
    (27450, 15232),
    (30662, 24366),
    (977, 15),
    (777, 344),
    (303, 576),
    (21, 428),
    (722, 711),
    (350, 657),
    (552, 74),
    (738, 381),
    (787, 640),
    (781, 813),
    (679, 334),
    (192, 190),
    (385, 272),
    (760, 942),
    (380, 802),
    (56, 11),
    (87, 33),
    (34, 96),
    (81, 58),
    (43, 45),
    (4, 50),
    (26, 89),
    (31, 83),
    (60, 1),
    (20, 76),
    (32, 71),
    (66, 47),
    (2, 18),
    (75, 37),
    (0, 0),
    (1, 1),
    (3, 3),
];

fn sample_mapper() -> Mapper<i32> {
    let m = Mapper::new();
    for (index, value) in SAMPLE {
        assert!(m.set(index, value));
    }
    m
}

fn sorted_sample() -> Vec<(i32, i32)> {
    let mut data = SAMPLE.to_vec();
    data.sort_by_key(|&(index, _)| index);
    data
}

#[test]
fn test_set_and_get() {
    let m: Mapper<i32> = Mapper::new();
    assert!(m.set(0, 42));
    assert_eq!(m.get(0), Some(42));
    assert_eq!(m.len(), 1);
}

#[test]
fn test_set_reports_is_new() {
    let m = Mapper::new();
    assert!(m.set(0, 21));
    assert_eq!(m.get(0), Some(21));

    assert!(!m.set(0, 42));
    assert_eq!(m.get(0), Some(42));
    assert_eq!(m.len(), 1);
}

#[test]
fn test_get_missing() {
    let m: Mapper<i32> = Mapper::new();
    assert_eq!(m.get(0), None);
    assert!(!m.contains(0));
    assert!(m.is_empty());
}

#[test]
fn test_insert_only_fills_empty_slots() {
    let m = Mapper::new();
    assert!(m.insert(0, 21));
    assert_eq!(m.get(0), Some(21));

    assert!(!m.insert(0, 42));
    assert_eq!(m.get(0), Some(21));

    assert_eq!(m.try_insert(0, 21), Err(21));
    assert_eq!(m.try_insert(1, 42), Ok(()));
    assert_eq!(m.len(), 2);
}

#[test]
fn test_exchange() {
    let m = Mapper::new();
    assert!(m.set(0, 21));

    assert_eq!(m.exchange(0, 42), Some(21));
    assert_eq!(m.get(0), Some(42));

    assert_eq!(m.exchange(1, 21), None);
    assert_eq!(m.get(1), Some(21));
    assert_eq!(m.len(), 2);
}

#[test]
fn test_remove_at() {
    let m = Mapper::new();
    m.set(0, 21);
    assert_eq!(m.remove_at(0), Some(21));
    assert_eq!(m.get(0), None);
    assert_eq!(m.remove_at(1), None);

    m.set(0, 21);
    assert!(m.delete_at(0));
    assert!(!m.delete_at(0));
    assert!(!m.delete_at(1));
    assert_eq!(m.len(), 0);
}

#[test]
fn test_conditional_removal() {
    let m = Mapper::new();
    m.set(7, String::from("keep"));
    assert!(!m.remove_value_at(7, &String::from("other")));
    assert_eq!(m.remove_where_at(7, |v| v.starts_with('x')), None);
    assert_eq!(m.len(), 1);

    assert!(m.remove_value_at(7, &String::from("keep")));
    assert!(m.is_empty());

    m.set(7, String::from("xyz"));
    assert_eq!(m.remove_where_at(7, |v| v.starts_with('x')), Some("xyz".into()));
    assert!(m.is_empty());
}

#[test]
fn test_absent_marker_round_trips() {
    // `None` is an ordinary stored value, distinct from an empty slot.
    let m: Mapper<Option<String>> = Mapper::new();
    assert!(m.insert(0, None));
    assert_eq!(m.get(0), Some(None));

    assert!(!m.set(0, Some("Hello".into())));
    assert_eq!(m.get(0), Some(Some("Hello".into())));

    assert!(!m.set(0, None));
    assert_eq!(m.get(0), Some(None));

    assert_eq!(m.exchange(0, Some("Hello".into())), Some(None));
    assert_eq!(m.exchange(0, None), Some(Some("Hello".into())));
    assert_eq!(m.len(), 1);
}

#[test]
fn test_sparse_data() {
    let m = sample_mapper();
    assert_eq!(m.len(), SAMPLE.len());
    for (index, value) in SAMPLE {
        assert_eq!(m.get(index), Some(value));
    }
    let expected: Vec<i32> = sorted_sample().into_iter().map(|(_, v)| v).collect();
    let seen: Vec<i32> = m.iter().collect();
    assert_eq!(seen, expected);
    assert_eq!(m.entries().collect::<Vec<_>>(), sorted_sample());
}

#[test]
fn test_copy_to() {
    let m = sample_mapper();
    let mut target = vec![0; SAMPLE.len()];
    assert_eq!(m.copy_to(&mut target, 0), Ok(SAMPLE.len()));
    let expected: Vec<i32> = sorted_sample().into_iter().map(|(_, v)| v).collect();
    assert_eq!(target, expected);
}

#[test]
fn test_copy_to_offset_and_errors() {
    let m = Mapper::new();
    m.set(5, 'b');
    m.set(1, 'a');

    let mut target = ['-'; 4];
    assert_eq!(m.copy_to(&mut target, 2), Ok(2));
    assert_eq!(target, ['-', '-', 'a', 'b']);

    assert_eq!(
        m.copy_to(&mut target, 3),
        Err(CopyError::InsufficientCapacity {
            needed: 2,
            available: 1
        })
    );
    assert_eq!(
        m.copy_to(&mut target, 5),
        Err(CopyError::StartOutOfBounds { start: 5, len: 4 })
    );
    // Start at the very end is fine for an empty map.
    let empty: Mapper<char> = Mapper::new();
    assert_eq!(empty.copy_to(&mut target, 4), Ok(0));
}

#[test]
fn test_negative_indices_enumerate_after_positive() {
    let m = Mapper::new();
    for index in [-1, -100, 5, i32::MIN, 0, i32::MAX] {
        m.set(index, index);
    }
    let order: Vec<i32> = m.iter().collect();
    assert_eq!(order, vec![0, 5, i32::MAX, i32::MIN, -100, -1]);
}

#[test]
fn test_from_iter_and_extend() {
    let mut m: Mapper<u64> = (0..10).map(|i| (i * 1000, i as u64)).collect();
    assert_eq!(m.len(), 10);
    m.extend([(1, 100), (0, 200)]);
    assert_eq!(m.len(), 11);
    assert_eq!(m.get(0), Some(200));

    let mut total = 0;
    for v in &m {
        total += v;
    }
    // 1..10 from the first batch, 200 replacing index 0, 100 at index 1.
    assert_eq!(total, 45 + 200 + 100);
}

#[test]
fn test_get_with_does_not_clone() {
    let m = Mapper::new();
    m.set(3, vec![1u8; 1024]);
    assert_eq!(m.get_with(3, Vec::len), Some(1024));
    assert_eq!(m.get_with(4, Vec::len), None);
}

#[test]
fn test_churn_leaves_map_usable() {
    let m = Mapper::new();
    for round in 0..5 {
        for i in 0..2_000 {
            m.set(i * 37, round);
        }
        assert_eq!(m.len(), 2_000);
        for i in 0..2_000 {
            assert_eq!(m.remove_at(i * 37), Some(round));
        }
        assert!(m.is_empty());
        assert_eq!(m.iter().count(), 0);
    }
}
