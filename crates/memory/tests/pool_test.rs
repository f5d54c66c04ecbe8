use std::sync::Arc;

use memory::{DeviceMemory, Direction, MemoryManager, Pool, PoolSizes};
use types::{ResultCode, DRAM_BASE, PAGE_SIZE};

fn small_manager() -> MemoryManager {
    let sizes = PoolSizes {
        application: 16 * PAGE_SIZE,
        applet: 4 * PAGE_SIZE,
        system: 4 * PAGE_SIZE,
        system_non_secure: 4 * PAGE_SIZE,
    };
    let device = Arc::new(DeviceMemory::new(sizes.total()));
    MemoryManager::new(device, sizes)
}

#[test]
fn oversized_allocation_leaves_pool_unchanged() {
    let mm = small_manager();
    let held = mm
        .allocate_and_open(10, Pool::Application, Direction::FromFront)
        .unwrap();
    let free_before = mm.free_pages(Pool::Application);
    assert_eq!(free_before, 6);

    let err = mm
        .allocate_and_open(7, Pool::Application, Direction::FromFront)
        .unwrap_err();
    assert_eq!(err, ResultCode::OUT_OF_MEMORY);
    assert_eq!(mm.free_pages(Pool::Application), free_before);

    // the remaining capacity is still fully usable
    let rest = mm
        .allocate_and_open(6, Pool::Application, Direction::FromFront)
        .unwrap();
    assert_eq!(mm.free_pages(Pool::Application), 0);
    mm.close(&rest);
    mm.close(&held);
    assert_eq!(mm.free_pages(Pool::Application), 16);
}

#[test]
fn directions_allocate_from_opposite_ends() {
    let mm = small_manager();
    let front = mm
        .allocate_and_open(2, Pool::Application, Direction::FromFront)
        .unwrap();
    let back = mm
        .allocate_and_open(2, Pool::Application, Direction::FromBack)
        .unwrap();
    assert_eq!(front.blocks()[0].address, DRAM_BASE);
    assert_eq!(back.blocks()[0].address, DRAM_BASE + 14 * PAGE_SIZE);
    assert_eq!(back.blocks().len(), 1);
}

#[test]
fn scattered_allocation_fills_holes() {
    let mm = small_manager();
    let a = mm.allocate_and_open(2, Pool::Application, Direction::FromFront).unwrap();
    let b = mm.allocate_and_open(2, Pool::Application, Direction::FromFront).unwrap();
    let c = mm.allocate_and_open(2, Pool::Application, Direction::FromFront).unwrap();
    mm.close(&a);
    mm.close(&c);

    let group = mm.allocate_and_open(4, Pool::Application, Direction::FromFront).unwrap();
    assert_eq!(group.num_pages(), 4);
    assert_eq!(group.blocks().len(), 2);
    assert!(group.pages().all(|p| mm.ref_count(p) == 1));
    assert!(b.pages().all(|p| mm.ref_count(p) == 1));
}

#[test]
fn open_and_close_reference_count_pages() {
    let mm = small_manager();
    let group = mm.allocate_and_open(3, Pool::System, Direction::FromFront).unwrap();
    let first = group.blocks()[0].address;
    mm.open(&group).unwrap();
    assert_eq!(mm.ref_count(first), 2);
    mm.close(&group);
    assert_eq!(mm.used_pages(Pool::System), 3);
    mm.close(&group);
    assert_eq!(mm.used_pages(Pool::System), 0);
    assert_eq!(mm.ref_count(first), 0);
}

#[test]
fn saturated_reference_count_refuses_another_open() {
    let mm = small_manager();
    let group = mm.allocate_and_open(2, Pool::System, Direction::FromFront).unwrap();
    let last = group.pages().last().unwrap();
    // push one page to the ceiling; the other stays low
    for _ in 1..u16::MAX {
        mm.open_range(last, 1).unwrap();
    }
    assert_eq!(mm.ref_count(last), u16::MAX);

    assert_eq!(mm.open(&group), Err(ResultCode::OUT_OF_RESOURCE));
    assert!(group.pages().all(|p| p == last || mm.ref_count(p) == 1));
    assert_eq!(mm.ref_count(last), u16::MAX);
}

#[test]
fn allocations_are_zeroed() {
    let mm = small_manager();
    let group = mm.allocate_and_open(1, Pool::Applet, Direction::FromFront).unwrap();
    let page = group.blocks()[0].address;
    mm.device_memory().write(page, &[0xAA; 16]).unwrap();
    mm.close(&group);

    let again = mm.allocate_and_open(1, Pool::Applet, Direction::FromFront).unwrap();
    assert_eq!(again.blocks()[0].address, page);
    let mut buf = [0xFFu8; 16];
    mm.device_memory().read(page, &mut buf).unwrap();
    assert_eq!(buf, [0u8; 16]);
}

#[test]
fn contiguous_allocation_needs_a_single_run() {
    let mm = small_manager();
    let a = mm.allocate_and_open(1, Pool::Applet, Direction::FromFront).unwrap();
    let _b = mm.allocate_contiguous(1, Pool::Applet, Direction::FromFront).unwrap();
    mm.close(&a);
    // pages 0, 2 and 3 are free but only 2..4 is contiguous
    assert_eq!(
        mm.allocate_contiguous(3, Pool::Applet, Direction::FromFront),
        Err(ResultCode::OUT_OF_MEMORY)
    );
    let run = mm.allocate_contiguous(2, Pool::Applet, Direction::FromFront).unwrap();
    assert_eq!(run, DRAM_BASE + 16 * PAGE_SIZE + 2 * PAGE_SIZE);
}
