use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use memory::layout::AddressSpaceLayout;
use memory::{
    AddressSpace, DeviceMemory, Direction, MappingObserver, MemoryManager, Pool, PoolSizes,
    RegionKind,
};
use types::{MemoryAttribute, MemoryPermission, MemoryState, ResultCode, VAddr, PAGE_SIZE};

fn manager(pages: u64) -> Arc<MemoryManager> {
    let sizes = PoolSizes {
        application: pages * PAGE_SIZE,
        applet: 0x10 * PAGE_SIZE,
        system: 0x10 * PAGE_SIZE,
        system_non_secure: 0x10 * PAGE_SIZE,
    };
    let device = Arc::new(DeviceMemory::new(sizes.total()));
    Arc::new(MemoryManager::new(device, sizes))
}

fn address_space(mm: &Arc<MemoryManager>) -> AddressSpace {
    AddressSpace::new(1, mm.clone(), Pool::Application, 0x1234)
}

const CODE: VAddr = AddressSpaceLayout::CODE_START;

#[test]
fn map_then_unmap_restores_the_address_space() {
    let mm = manager(0x40);
    let mut aspace = address_space(&mm);
    let before = aspace.query_memory(CODE);

    let group = mm.allocate_and_open(4, Pool::Application, Direction::FromFront).unwrap();
    aspace
        .map_page_group(CODE, &group, MemoryState::Code, MemoryPermission::READ_EXECUTE)
        .unwrap();
    assert_eq!(aspace.query_memory(CODE + 0x3000).state, MemoryState::Code);

    aspace.unmap_pages(CODE, 4, MemoryState::Code).unwrap();
    assert_eq!(aspace.query_memory(CODE), before);
    assert!(!aspace.is_mapped(CODE));

    // the same range maps again
    aspace
        .map_page_group(CODE, &group, MemoryState::Code, MemoryPermission::READ_EXECUTE)
        .unwrap();
    mm.close(&group);
    aspace.unmap_pages(CODE, 4, MemoryState::Code).unwrap();
    assert_eq!(mm.used_pages(Pool::Application), 0);
}

#[test]
fn mapping_over_a_mapped_page_is_rejected() {
    let mm = manager(0x40);
    let mut aspace = address_space(&mm);
    aspace
        .allocate_and_map(CODE + 0x2000, 1, MemoryState::CodeData, MemoryPermission::READ_WRITE)
        .unwrap();
    let used = mm.used_pages(Pool::Application);

    let group = mm.allocate_and_open(4, Pool::Application, Direction::FromFront).unwrap();
    let err = aspace
        .map_page_group(CODE, &group, MemoryState::Code, MemoryPermission::READ_EXECUTE)
        .unwrap_err();
    assert_eq!(err, ResultCode::INVALID_CURRENT_MEMORY);
    assert!(!aspace.is_mapped(CODE));
    mm.close(&group);
    assert_eq!(mm.used_pages(Pool::Application), used);
}

#[test]
fn unaligned_requests_fail() {
    let mm = manager(0x10);
    let mut aspace = address_space(&mm);
    assert_eq!(
        aspace.allocate_and_map(CODE + 0x10, 1, MemoryState::Code, MemoryPermission::READ),
        Err(ResultCode::INVALID_ADDRESS)
    );
    assert_eq!(
        aspace.unmap_pages(CODE, 0, MemoryState::Code),
        Err(ResultCode::INVALID_SIZE)
    );
}

#[test]
fn random_placement_stays_inside_the_region() {
    let mm = manager(0x40);
    let mut aspace = address_space(&mm);
    let alias = aspace.region(RegionKind::Alias);
    for _ in 0..8 {
        let addr = aspace
            .allocate_and_map_anywhere(RegionKind::Alias, 2, MemoryState::AliasCode, MemoryPermission::READ)
            .unwrap();
        assert!(alias.contains(addr, 2 * PAGE_SIZE));
        assert_eq!(addr % PAGE_SIZE, 0);
    }
}

#[test]
fn random_placement_gives_up_when_region_is_full() {
    let mm = manager(0x40);
    let mut aspace = address_space(&mm);
    let region = aspace.region(RegionKind::Code);
    // a request as large as the region can only land at one address; fill
    // its first page so no candidate is free
    aspace
        .allocate_and_map(region.start, 1, MemoryState::Code, MemoryPermission::READ)
        .unwrap();
    let group = mm.allocate_and_open(1, Pool::Application, Direction::FromFront).unwrap();
    let huge = {
        let mut g = memory::PageGroup::new();
        for _ in 0..(region.size / PAGE_SIZE) {
            g.add_block(group.blocks()[0].address, 1);
        }
        g
    };
    assert_eq!(
        aspace.map_page_group_anywhere(RegionKind::Code, &huge, MemoryState::Code, MemoryPermission::READ),
        Err(ResultCode::OUT_OF_MEMORY)
    );
}

#[derive(Default)]
struct RecordingObserver {
    fail_maps: bool,
    unmapped: Mutex<Vec<(VAddr, u64)>>,
    maps: AtomicUsize,
}

impl MappingObserver for RecordingObserver {
    fn on_map(
        &self,
        _asid: u64,
        _addr: VAddr,
        _size: u64,
        _state: MemoryState,
        _perm: MemoryPermission,
    ) -> Result<(), ResultCode> {
        self.maps.fetch_add(1, Ordering::SeqCst);
        if self.fail_maps {
            Err(ResultCode::OUT_OF_RESOURCE)
        } else {
            Ok(())
        }
    }

    fn on_unmap(&self, _asid: u64, addr: VAddr, size: u64) {
        self.unmapped.lock().unwrap().push((addr, size));
    }
}

#[test]
fn observer_failure_rolls_back_the_mapping() {
    let mm = manager(0x10);
    let mut aspace = address_space(&mm);
    let observer = Arc::new(RecordingObserver {
        fail_maps: true,
        ..Default::default()
    });
    aspace.add_observer(observer.clone());

    let err = aspace
        .allocate_and_map(CODE, 2, MemoryState::Code, MemoryPermission::READ_EXECUTE)
        .unwrap_err();
    assert_eq!(err, ResultCode::OUT_OF_RESOURCE);
    assert_eq!(observer.maps.load(Ordering::SeqCst), 1);
    assert!(!aspace.is_mapped(CODE));
    assert_eq!(aspace.query_memory(CODE).state, MemoryState::Free);
    assert_eq!(mm.used_pages(Pool::Application), 0);
}

#[test]
fn unmap_notifies_observers() {
    let mm = manager(0x10);
    let mut aspace = address_space(&mm);
    let observer = Arc::new(RecordingObserver::default());
    aspace.add_observer(observer.clone());
    aspace
        .allocate_and_map(CODE, 2, MemoryState::Code, MemoryPermission::READ_EXECUTE)
        .unwrap();
    aspace.unmap_pages(CODE, 2, MemoryState::Code).unwrap();
    assert_eq!(*observer.unmapped.lock().unwrap(), vec![(CODE, 2 * PAGE_SIZE)]);
}

#[test]
fn heap_grows_and_shrinks_in_2mib_steps() {
    let mm = manager(0x400);
    let mut aspace = address_space(&mm);
    assert_eq!(aspace.set_heap_size(0x1000), Err(ResultCode::INVALID_SIZE));

    let base = aspace.set_heap_size(0x20_0000).unwrap();
    assert_eq!(base, AddressSpaceLayout::HEAP_START);
    aspace.write_u64(base + 0x1F_FFF8, 0xDEAD_BEEF).unwrap();
    assert_eq!(aspace.read_u64(base + 0x1F_FFF8).unwrap(), 0xDEAD_BEEF);
    assert_eq!(mm.used_pages(Pool::Application), 0x200);

    aspace.set_heap_size(0).unwrap();
    assert_eq!(mm.used_pages(Pool::Application), 0);
    assert!(!aspace.is_mapped(base));
}

#[test]
fn heap_growth_fails_cleanly_when_pool_is_exhausted() {
    let mm = manager(0x100);
    let mut aspace = address_space(&mm);
    assert_eq!(aspace.set_heap_size(0x20_0000), Err(ResultCode::OUT_OF_MEMORY));
    assert_eq!(aspace.heap_size(), 0);
    assert_eq!(mm.used_pages(Pool::Application), 0);
}

#[test]
fn set_memory_permission_requires_reprotectable_state() {
    let mm = manager(0x10);
    let mut aspace = address_space(&mm);
    aspace
        .allocate_and_map(CODE, 1, MemoryState::Code, MemoryPermission::READ_EXECUTE)
        .unwrap();
    aspace
        .allocate_and_map(CODE + PAGE_SIZE, 1, MemoryState::CodeData, MemoryPermission::READ_WRITE)
        .unwrap();

    assert_eq!(
        aspace.set_memory_permission(CODE, PAGE_SIZE, MemoryPermission::READ),
        Err(ResultCode::INVALID_CURRENT_MEMORY)
    );
    assert_eq!(
        aspace.set_memory_permission(CODE + PAGE_SIZE, PAGE_SIZE, MemoryPermission::READ_EXECUTE),
        Err(ResultCode::INVALID_NEW_MEMORY_PERMISSION)
    );
    aspace
        .set_memory_permission(CODE + PAGE_SIZE, PAGE_SIZE, MemoryPermission::READ)
        .unwrap();
    assert_eq!(
        aspace.query_memory(CODE + PAGE_SIZE).permission,
        MemoryPermission::READ
    );
}

#[test]
fn map_memory_aliases_heap_into_stack_region() {
    let mm = manager(0x400);
    let mut aspace = address_space(&mm);
    let heap = aspace.set_heap_size(0x20_0000).unwrap();
    aspace.write_u32(heap, 0xCAFE).unwrap();
    let stack = aspace.region(RegionKind::Stack).start;

    aspace.map_memory(stack, heap, 0x2000).unwrap();
    assert_eq!(aspace.read_u32(stack).unwrap(), 0xCAFE);
    let src = aspace.query_memory(heap);
    assert_eq!(src.attribute, MemoryAttribute::LOCKED);
    assert_eq!(src.permission, MemoryPermission::empty());
    assert_eq!(aspace.query_memory(stack).state, MemoryState::Stack);

    // a locked source cannot be aliased twice
    assert_eq!(
        aspace.map_memory(stack + 0x10000, heap, 0x2000),
        Err(ResultCode::INVALID_CURRENT_MEMORY)
    );

    aspace.unmap_memory(stack, heap, 0x2000).unwrap();
    assert_eq!(aspace.query_memory(heap).permission, MemoryPermission::READ_WRITE);
    assert_eq!(aspace.query_memory(stack).state, MemoryState::Free);
}

#[test]
fn reads_cross_page_boundaries() {
    let mm = manager(0x10);
    let mut aspace = address_space(&mm);
    aspace
        .allocate_and_map(CODE, 2, MemoryState::CodeData, MemoryPermission::READ_WRITE)
        .unwrap();
    aspace.write(CODE + 0xFFE, b"hello\0").unwrap();
    assert_eq!(aspace.read_cstring(CODE + 0xFFE, 32).unwrap(), "hello");
    assert_eq!(
        aspace.read_u32(CODE + 2 * PAGE_SIZE - 2),
        Err(ResultCode::INVALID_POINTER)
    );
}

#[test]
fn finalize_releases_every_page() {
    let mm = manager(0x400);
    let mut aspace = address_space(&mm);
    aspace.set_heap_size(0x20_0000).unwrap();
    aspace
        .allocate_and_map(CODE, 3, MemoryState::Code, MemoryPermission::READ_EXECUTE)
        .unwrap();
    aspace.finalize();
    assert_eq!(mm.used_pages(Pool::Application), 0);
}
