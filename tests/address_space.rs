//! End-to-end process-lifecycle tests against the public API.

use std::sync::Arc;

use rand::{rngs::StdRng, Rng, SeedableRng};

use kmem::{
    AddressSpace, FrameAllocator, KernelLayout, KernelRegion, MapPermission, PhysAddr,
    PteFlags, VirtAddr, VirtPageNum, PAGE_SIZE, TRAMPOLINE,
};

fn pool(frames: usize) -> Arc<FrameAllocator> {
    let base = PhysAddr(0x8030_0000);
    Arc::new(FrameAllocator::new(
        base,
        PhysAddr(base.0 + frames * PAGE_SIZE),
        1,
    ))
}

fn multicore_pool(frames: usize, cores: usize) -> Arc<FrameAllocator> {
    let base = PhysAddr(0x8030_0000);
    Arc::new(FrameAllocator::new(
        base,
        PhysAddr(base.0 + frames * PAGE_SIZE),
        cores,
    ))
}

fn layout() -> Arc<KernelLayout> {
    Arc::new(KernelLayout {
        regions: vec![
            KernelRegion {
                name: "uart",
                va: VirtAddr(0x1000_0000),
                pa: PhysAddr(0x1000_0000),
                len: PAGE_SIZE,
                perm: MapPermission::R | MapPermission::W,
            },
            KernelRegion {
                name: "kernel",
                va: VirtAddr(0x8000_0000),
                pa: PhysAddr(0x8000_0000),
                len: 4 * PAGE_SIZE,
                perm: MapPermission::R | MapPermission::W | MapPermission::X,
            },
            KernelRegion {
                name: "trampoline",
                va: VirtAddr(TRAMPOLINE),
                pa: PhysAddr(0x8000_4000),
                len: PAGE_SIZE,
                perm: MapPermission::R | MapPermission::X,
            },
        ],
    })
}

/// Asserts that the mirror repeats every user mapping with the user bit
/// stripped and maps nothing user-side beyond the current size.
fn assert_mirror_matches(space: &AddressSpace) {
    let pages = (space.size() + PAGE_SIZE - 1) / PAGE_SIZE;
    for vpn in 0..pages {
        let upte = space
            .translate(VirtPageNum(vpn))
            .unwrap_or_else(|| panic!("page {vpn} missing below the size mark"));
        let mpte = space
            .mirror_table()
            .translate(VirtPageNum(vpn))
            .unwrap_or_else(|| panic!("page {vpn} missing from the mirror"));
        assert_eq!(mpte.ppn(), upte.ppn());
        assert!(!mpte.is_user());
        assert_eq!(mpte.flags() | PteFlags::U, upte.flags() | PteFlags::U);
    }
    for vpn in pages..pages + 4 {
        assert!(space.translate(VirtPageNum(vpn)).is_none());
        assert!(space.mirror_table().translate(VirtPageNum(vpn)).is_none());
    }
}

#[test]
fn process_lifecycle() {
    let pool = pool(128);
    let layout = layout();

    let mut parent = AddressSpace::new_user(&pool, 0, &layout).unwrap();
    assert_eq!(parent.grow(8192).unwrap(), 8192);
    assert_mirror_matches(&parent);

    parent.copy_out(VirtAddr(4096), b"ten bytes!").unwrap();

    let child = parent.fork_copy().unwrap();
    assert_mirror_matches(&child);

    // Child diverges; the parent must not see it.
    child.copy_out(VirtAddr(4096), b"CHANGED!!!").unwrap();
    let mut buf = [0u8; 10];
    parent.copy_in(&mut buf, VirtAddr(4096)).unwrap();
    assert_eq!(&buf, b"ten bytes!");
    child.copy_in(&mut buf, VirtAddr(4096)).unwrap();
    assert_eq!(&buf, b"CHANGED!!!");

    child.destroy();

    let free_before = pool.free_frames();
    assert_eq!(parent.shrink(0), 0);
    assert_eq!(pool.free_frames(), free_before + 2);
    assert!(parent.translate(VirtPageNum(0)).is_none());
    assert_mirror_matches(&parent);

    parent.destroy();
    assert_eq!(pool.free_frames(), pool.total_frames());
}

#[test]
fn random_grow_shrink_conserves_frames() {
    let pool = pool(256);
    let layout = layout();
    let mut rng = StdRng::seed_from_u64(0x6b6d656d);

    for round in 0..16 {
        let mut space = AddressSpace::new_user(&pool, 0, &layout).unwrap();
        let mut top = 0usize;
        for _ in 0..24 {
            if rng.gen_bool(0.6) {
                let want = top + rng.gen_range(1..5) * PAGE_SIZE + rng.gen_range(0..PAGE_SIZE);
                if let Ok(new_top) = space.grow(want) {
                    top = new_top;
                }
            } else if top > 0 {
                top = space.shrink(rng.gen_range(0..top));
            }
            assert_eq!(space.size(), top);
            assert_mirror_matches(&space);
        }
        space.destroy();
        assert_eq!(
            pool.free_frames(),
            pool.total_frames(),
            "leak after round {round}"
        );
    }
}

#[test]
fn concurrent_forks_steal_across_core_lists() {
    let pool = multicore_pool(256, 4);
    let layout = layout();

    let mut template = AddressSpace::new_user(&pool, 0, &layout).unwrap();
    template.grow(4 * PAGE_SIZE).unwrap();
    template.copy_out(VirtAddr(0), b"shared prefix").unwrap();
    let template = Arc::new(template);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let template = Arc::clone(&template);
            std::thread::spawn(move || {
                for _ in 0..8 {
                    let clone = template.fork_copy().unwrap();
                    let mut buf = [0u8; 13];
                    clone.copy_in(&mut buf, VirtAddr(0)).unwrap();
                    assert_eq!(&buf, b"shared prefix");
                    clone.destroy();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    match Arc::try_unwrap(template) {
        Ok(template) => template.destroy(),
        Err(_) => panic!("template still shared"),
    }
    assert_eq!(pool.free_frames(), pool.total_frames());
}

#[test]
fn exhaustion_reports_and_recovers() {
    let pool = pool(24);
    let layout = layout();
    let mut space = AddressSpace::new_user(&pool, 0, &layout).unwrap();
    space.grow(2 * PAGE_SIZE).unwrap();

    // Far more than the pool holds.
    assert!(space.grow(200 * PAGE_SIZE).is_err());
    assert_eq!(space.size(), 2 * PAGE_SIZE);
    assert_mirror_matches(&space);

    // The space is still usable after the failure.
    space.copy_out(VirtAddr(100), b"still fine").unwrap();
    let mut buf = [0u8; 10];
    space.copy_in(&mut buf, VirtAddr(100)).unwrap();
    assert_eq!(&buf, b"still fine");

    space.destroy();
    assert_eq!(pool.free_frames(), pool.total_frames());
}
