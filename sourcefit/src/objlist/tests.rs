use super::*;

/// Builds a list with one detection per entry of `sizes`, each owning a
/// horizontal run of pixels on its own row.
fn list_with_runs(sizes: &[usize]) -> ObjectList {
    let mut list = ObjectList::new();
    for (row, &size) in sizes.iter().enumerate() {
        let mut head = END_OF_CHAIN;
        let mut tail = END_OF_CHAIN;
        for x in 0..size {
            let index = list
                .arena_mut()
                .push(PixelRecord::new(x as i32, row as i32, 1.0 + x as f32))
                .unwrap();
            if tail == END_OF_CHAIN {
                head = index;
            } else {
                list.arena_mut().link(tail, index);
            }
            tail = index;
        }
        let mut detection = Detection::from_chain(head, tail, size, DetectionFlags::empty());
        detection.preanalyse(list.arena());
        detection.number = row as u32;
        detection.blend = row as u32;
        list.add(detection, None).unwrap();
    }
    list
}

fn chain_indices(list: &ObjectList, detection: &Detection) -> Vec<i32> {
    list.pixels(detection).map(|(index, _)| index).collect()
}

#[test]
fn test_add_copies_and_relinks_chain() {
    let source = list_with_runs(&[3, 4]);
    let mut dst = list_with_runs(&[2]);
    let before = dst.arena().len();

    let index = dst.add(source.get(1).clone(), Some(source.arena())).unwrap();
    let added = dst.get(index);

    assert_eq!(added.head, before as i32);
    assert_eq!(added.tail, before as i32 + 3);
    assert_eq!(chain_indices(&dst, added), vec![2, 3, 4, 5]);
    let xs: Vec<i32> = dst.pixels(added).map(|(_, p)| p.x).collect();
    assert_eq!(xs, vec![0, 1, 2, 3]);
    assert_eq!(dst.arena().get(added.tail).next, END_OF_CHAIN);
}

#[test]
fn test_add_without_source_keeps_indices() {
    let source = list_with_runs(&[3]);
    let mut dst = ObjectList::new();
    dst.add(source.get(0).clone(), None).unwrap();
    assert_eq!(dst.get(0).head, source.get(0).head);
    assert!(dst.arena().is_empty());
}

#[test]
fn test_add_then_remove_restores_counts() {
    let source = list_with_runs(&[5]);
    let mut list = list_with_runs(&[2, 3, 4]);
    let (count, pixels) = (list.len(), list.total_pixels());

    let index = list.add(source.get(0).clone(), Some(source.arena())).unwrap();
    assert_eq!(list.total_pixels(), pixels + 5);
    list.remove(index);

    assert_eq!(list.len(), count);
    assert_eq!(list.total_pixels(), pixels);
}

#[test]
fn test_remove_swaps_last_into_hole() {
    let mut list = list_with_runs(&[1, 2, 3, 4]);
    let removed = list.remove(1);
    assert_eq!(removed.number, 1);
    assert_eq!(list.len(), 3);
    assert_eq!(list.get(1).number, 3);
    // Chains of the survivors are still intact.
    for detection in &list {
        assert_eq!(list.pixels(detection).count(), detection.npix);
    }
}

#[test]
fn test_capacity_grows_in_steps_and_is_released() {
    let mut list = ObjectList::new();
    assert_eq!(list.capacity(), 0);

    for i in 0..=OBJLIST_CAPACITY_STEP {
        list.add(
            Detection {
                number: i as u32,
                ..Detection::default()
            },
            None,
        )
        .unwrap();
    }
    assert!(list.capacity() >= 2 * OBJLIST_CAPACITY_STEP);

    while list.len() > 1 {
        list.remove(0);
    }
    assert!(list.capacity() <= 2 * OBJLIST_CAPACITY_STEP);
    assert!(list.capacity() >= 1);

    list.remove(0);
    assert!(list.is_empty());
    assert_eq!(list.capacity(), 0);
}

#[test]
fn test_move_preserves_total_pixels() {
    let mut src = list_with_runs(&[3, 5, 7]);
    let mut dst = list_with_runs(&[2]);
    let total = src.total_pixels() + dst.total_pixels();

    let index = src.move_to(1, &mut dst).unwrap();

    assert_eq!(src.len(), 2);
    assert_eq!(dst.len(), 2);
    assert_eq!(dst.get(index).npix, 5);
    assert_eq!(dst.pixels(dst.get(index)).count(), 5);
    assert_eq!(src.total_pixels() + dst.total_pixels(), total);
}

#[test]
fn test_extract_blend_moves_whole_group() {
    let mut list = list_with_runs(&[2, 3, 4, 5]);
    list.get_mut(0).blend = 7;
    list.get_mut(2).blend = 7;

    let group = list.extract_blend(7).unwrap();

    assert_eq!(group.len(), 2);
    assert!(group.iter().all(|d| d.blend == 7));
    assert_eq!(group.total_pixels(), 6);
    assert_eq!(list.len(), 2);
    assert!(list.iter().all(|d| d.blend != 7));
}

#[test]
fn test_chains_stay_disjoint_after_moves() {
    let mut src = list_with_runs(&[4, 4, 4]);
    let mut dst = ObjectList::new();
    while !src.is_empty() {
        src.move_to(0, &mut dst).unwrap();
    }

    let mut seen = std::collections::HashSet::new();
    for detection in &dst {
        for index in chain_indices(&dst, detection) {
            assert!(seen.insert(index), "pixel {} appears twice", index);
        }
    }
    assert_eq!(seen.len(), 12);
}

#[test]
fn test_preanalyse_computes_geometry() {
    let list = list_with_runs(&[5]);
    let detection = list.get(0);
    assert_eq!((detection.xmin, detection.xmax), (0, 4));
    assert_eq!((detection.ymin, detection.ymax), (0, 0));
    assert_eq!(detection.npix, 5);
    assert_eq!(detection.flux, 15.0);
    assert_eq!(detection.peak, 5.0);
    assert_eq!(detection.peak_x, 4);
    // Flux-weighted barycentre of values 1..=5 at x = 0..=4.
    assert!((detection.mx - 40.0 / 15.0).abs() < 1e-12);
    assert!(detection.a > detection.b);
    assert!(detection.theta.abs() < 1e-9);
}

#[test]
#[should_panic(expected = "remove index 0 out of range for 0 detections")]
fn test_remove_from_empty_list_panics() {
    ObjectList::new().remove(0);
}

#[test]
#[should_panic(expected = "remove index 3 out of range for 2 detections")]
fn test_remove_past_end_panics() {
    let mut list = list_with_runs(&[2, 3]);
    list.remove(3);
}
