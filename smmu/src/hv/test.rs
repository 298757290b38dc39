// SPDX-License-Identifier: MPL-2.0

use super::{
    channel::{ChannelState, CommChannel},
    loopback::{Fault, LoopbackServer, ServerPage},
    msg::ServerError,
    *,
};
use crate::{mm::SimFrameAllocator, space::AsPool};

const RW: PageFlags = PageFlags::RW;

struct Fixture {
    server: Arc<LoopbackServer>,
    backend: HypervisorBackend,
    pool: AsPool,
}

fn fixture(policy: ShadowPolicy) -> Fixture {
    let server = Arc::new(LoopbackServer::new(3, 8..12, 0..4 << 32, 0xff));
    let config = SmmuConfig {
        hv_poll_budget: 4,
        shadow_policy: policy,
        ..SmmuConfig::default()
    };
    let backend = HypervisorBackend::connect(server.clone(), &config).unwrap();
    let frames = Arc::new(SimFrameAllocator::new(0x8000_0000, 64));
    let pool = AsPool::new(backend.info().as_pool.clone(), frames);
    Fixture {
        server,
        backend,
        pool,
    }
}

fn attr(flags: PageFlags) -> i32 {
    flags.bits() as i32
}

#[test]
fn connect_reads_server_info() {
    let f = fixture(ShadowPolicy::ServerFirst);
    assert_eq!(f.server.requests(), [Opcode::Connect, Opcode::SmmuInfo]);
    assert!(f.server.is_connected());
    assert_eq!(
        f.backend.info(),
        &SmmuInfo {
            as_pool: 8..12,
            iova_window: 0..4 << 32,
            swgid_mask: 0xff,
        }
    );
}

#[test]
fn connect_without_channels() {
    let server = Arc::new(LoopbackServer::new(0, 0..4, 0..1 << 32, 1));
    assert_eq!(
        HypervisorBackend::connect(server, &SmmuConfig::default()).err(),
        Some(Error::NoDevice)
    );
}

#[test]
fn drop_disconnects() {
    let f = fixture(ShadowPolicy::ServerFirst);
    let server = f.server.clone();
    drop(f);
    assert!(!server.is_connected());
    assert_eq!(server.requests().last(), Some(&Opcode::Disconnect));
}

#[test]
fn channels_spread_over_address_spaces() {
    let f = fixture(ShadowPolicy::ServerFirst);
    assert_eq!(f.backend.channel_for(8).id(), 0);
    assert_eq!(f.backend.channel_for(9).id(), 1);
    assert_eq!(f.backend.channel_for(10).id(), 0);
    assert_eq!(f.backend.control().id(), 2);
}

#[test]
fn map_reaches_server_and_shadow() {
    let f = fixture(ShadowPolicy::ServerFirst);
    let space = f.pool.alloc(0, &f.backend).unwrap();
    f.backend.map_page(&space, 0x10000, 0x500, RW).unwrap();

    assert_eq!(
        f.server.page(8, 0x10000),
        Some(ServerPage {
            ipa: 0x50_0000,
            attr: attr(RW),
        })
    );
    let info = space.read_mapping(0x10123);
    assert_eq!(info.paddr, 0x50_0123);
    assert_eq!(info.span, PAGE_SIZE as u64);
    assert_eq!(f.backend.lookup_remote(8, 0x10123), Some(0x50_0123));
    assert_eq!(f.backend.lookup_remote(8, 0x20000), None);
}

#[test]
fn map_run_sends_contiguous_chunks() {
    let f = fixture(ShadowPolicy::ServerFirst);
    let space = f.pool.alloc(0, &f.backend).unwrap();
    let pfns = [0x100, 0x101, 0x102, 0x200, 0x201];
    f.backend.map_run(&space, 0x3fe000, &pfns, RW).unwrap();

    let maps = f
        .server
        .requests()
        .iter()
        .filter(|op| **op == Opcode::MapPage)
        .count();
    assert_eq!(maps, 2);
    for (idx, pfn) in pfns.iter().enumerate() {
        let iova = 0x3fe000 + (idx as u64) * PAGE_SIZE as u64;
        assert_eq!(f.server.page(8, iova).map(|p| p.ipa), Some(pfn << PAGE_SHIFT));
        assert_eq!(space.read_mapping(iova).paddr, pfn << PAGE_SHIFT);
    }
}

#[test]
fn server_rejection_leaves_shadow_untouched() {
    let f = fixture(ShadowPolicy::ServerFirst);
    let space = f.pool.alloc(0, &f.backend).unwrap();
    f.server.inject(Fault::Reject(ServerError::PermissionDenied));
    assert_eq!(
        f.backend.map_page(&space, 0x10000, 0x500, RW),
        Err(Error::Server(ServerError::PermissionDenied))
    );
    assert!(!space.read_mapping(0x10000).is_mapped());
    space
        .with_tables(|pd| {
            assert!(pd.is_empty());
            Ok(())
        })
        .unwrap();
}

#[test]
fn rollback_restores_shadow() {
    let f = fixture(ShadowPolicy::ShadowFirstRollback);
    let space = f.pool.alloc(0, &f.backend).unwrap();
    f.backend.map_page(&space, 0x10000, 0x500, RW).unwrap();

    f.server.inject(Fault::Reject(ServerError::InvalidArgs));
    assert!(f.backend.map_run(&space, 0xf000, &[0x600, 0x601], RW).is_err());
    assert!(!space.read_mapping(0xf000).is_mapped());
    assert_eq!(space.read_mapping(0x10000).paddr, 0x50_0000);

    f.server.inject(Fault::Reject(ServerError::InvalidArgs));
    assert!(f.backend.unmap(&space, 0x10000, PAGE_SIZE).is_err());
    assert_eq!(space.read_mapping(0x10000).paddr, 0x50_0000);
    assert!(f.server.page(8, 0x10000).is_some());
}

#[test]
fn rollback_restores_large_page() {
    let f = fixture(ShadowPolicy::ShadowFirstRollback);
    let space = f.pool.alloc(0, &f.backend).unwrap();
    f.backend.map_large(&space, 0x40_0000, 0x1000, RW).unwrap();
    assert_eq!(f.server.mapped_pages(8), 1024);

    f.server.inject(Fault::Reject(ServerError::ServerState));
    assert!(f.backend.unmap(&space, 0x40_1000, PAGE_SIZE).is_err());
    let info = space.read_mapping(0x40_1000);
    assert_eq!(info.span, LARGE_PAGE_SIZE as u64);
    assert_eq!(info.paddr, 0x100_1000);
}

#[test]
fn unmap_clears_both_sides() {
    let f = fixture(ShadowPolicy::ServerFirst);
    let space = f.pool.alloc(0, &f.backend).unwrap();
    f.backend
        .map_run(&space, 0x20000, &[0x700, 0x701, 0x702], RW)
        .unwrap();
    assert_eq!(
        f.backend.unmap(&space, 0x20000, 3 * PAGE_SIZE),
        Ok(3 * PAGE_SIZE)
    );
    assert_eq!(f.server.mapped_pages(8), 0);
    assert!(!space.read_mapping(0x21000).is_mapped());
    assert_eq!(
        f.backend.unmap(&space, 0x20000, 3 * PAGE_SIZE),
        Err(Error::NotMapped)
    );
}

#[test]
fn release_clears_server_mappings() {
    let f = fixture(ShadowPolicy::ServerFirst);
    let space = f.pool.alloc(0, &f.backend).unwrap();
    f.backend.map_page(&space, 0x10000, 0x500, RW).unwrap();
    f.backend.map_large(&space, 0x80_0000, 0x2000, RW).unwrap();
    f.pool.free(space.asid(), &f.backend);
    assert_eq!(f.server.mapped_pages(8), 0);
}

#[test]
fn double_map_is_refused() {
    for policy in [ShadowPolicy::ServerFirst, ShadowPolicy::ShadowFirstRollback] {
        let f = fixture(policy);
        let space = f.pool.alloc(0, &f.backend).unwrap();
        f.backend.map_page(&space, 0x1000_2000, 0x45, RW).unwrap();
        assert_eq!(
            f.backend.map_page(&space, 0x1000_2000, 0x99, RW),
            Err(Error::AlreadyMapped),
            "{:?}",
            policy
        );
        assert_eq!(space.read_mapping(0x1000_2000).paddr, 0x4_5000);
        assert_eq!(f.server.page(8, 0x1000_2000).map(|p| p.ipa), Some(0x4_5000));
        let maps = f
            .server
            .requests()
            .iter()
            .filter(|op| **op == Opcode::MapPage)
            .count();
        assert_eq!(maps, 1);
    }
}

#[test]
fn refused_page_is_rolled_back() {
    let f = fixture(ShadowPolicy::ShadowFirstRollback);
    let space = f.pool.alloc(0, &f.backend).unwrap();
    f.server.inject(Fault::Reject(ServerError::PermissionDenied));
    assert_eq!(
        f.backend.map_page(&space, 0x10000, 0x500, RW),
        Err(Error::Server(ServerError::PermissionDenied))
    );
    assert!(!space.read_mapping(0x10000).is_mapped());
    assert_eq!(f.server.mapped_pages(8), 0);
}

#[test]
fn rollback_resends_overwritten_pages() {
    // The server window ends at 0x10000, so the second chunk is refused.
    let server = Arc::new(LoopbackServer::new(2, 0..1, 0..0x10000, 1));
    let config = SmmuConfig {
        hv_poll_budget: 4,
        shadow_policy: ShadowPolicy::ShadowFirstRollback,
        ..SmmuConfig::default()
    };
    let backend = HypervisorBackend::connect(server.clone(), &config).unwrap();
    let pool = AsPool::new(0..1, Arc::new(SimFrameAllocator::new(0x8000_0000, 8)));
    let space = pool.alloc(0, &backend).unwrap();
    backend.map_page(&space, 0xf000, 0x500, RW).unwrap();

    assert_eq!(
        backend.map_run(&space, 0xf000, &[0x600, 0x800], RW),
        Err(Error::Server(ServerError::InvalidArgs))
    );
    assert_eq!(space.read_mapping(0xf000).paddr, 0x50_0000);
    assert!(!space.read_mapping(0x10000).is_mapped());
    assert_eq!(server.page(0, 0xf000).map(|p| p.ipa), Some(0x50_0000));
    assert_eq!(server.mapped_pages(0), 1);
}

#[test]
fn upper_window_is_released_at_its_own_iovas() {
    let f = fixture(ShadowPolicy::ServerFirst);
    let space = f.pool.alloc(1 << 32, &f.backend).unwrap();
    f.backend.map_page(&space, 0x1_0000_2000, 0x500, RW).unwrap();
    f.backend.map_large(&space, 0x1_0080_0000, 0x2000, RW).unwrap();
    assert!(f.server.page(8, 0x1_0000_2000).is_some());
    assert!(f.server.page(8, 0x2000).is_none());

    f.pool.free(space.asid(), &f.backend);
    assert_eq!(f.server.mapped_pages(8), 0);
}

#[test]
fn swapped_markers_are_never_delivered() {
    let f = fixture(ShadowPolicy::ServerFirst);
    let space = f.pool.alloc(0, &f.backend).unwrap();
    f.server.inject(Fault::SwapMarkers);
    assert_eq!(
        f.backend.map_page(&space, 0x10000, 0x500, RW),
        Err(Error::Corrupt)
    );
    assert!(!space.read_mapping(0x10000).is_mapped());
    assert_eq!(f.backend.channel_for(8).state(), ChannelState::Idle);

    f.server.inject(Fault::SwapMarkers);
    assert_eq!(f.backend.lookup_remote(8, 0x10000), None);
}

#[test]
fn foreign_and_truncated_frames_are_corrupt() {
    let f = fixture(ShadowPolicy::ServerFirst);
    for fault in [Fault::WrongChannel, Fault::Truncate, Fault::UnknownError] {
        f.server.inject(fault);
        assert_eq!(
            f.backend.stats_command(StatsCommand::On),
            Err(Error::Corrupt),
            "{:?}",
            fault
        );
    }
    f.backend.stats_command(StatsCommand::Reset).unwrap();
    assert_eq!(f.server.debug_ops().last(), Some(&StatsCommand::Reset));
}

#[test]
fn timeout_leaves_channel_stuck_until_reset() {
    let f = fixture(ShadowPolicy::ServerFirst);
    f.server.inject(Fault::Silent);
    assert_eq!(f.backend.stats_command(StatsCommand::On), Err(Error::Timeout));
    assert_eq!(f.backend.control().state(), ChannelState::Stuck);
    assert_eq!(
        f.backend.stats_command(StatsCommand::On),
        Err(Error::ChannelStuck)
    );

    f.backend.reset_channels();
    assert_eq!(f.backend.control().state(), ChannelState::Idle);
    f.backend.stats_command(StatsCommand::Off).unwrap();
}

#[test]
fn attach_rolls_back_on_refusal() {
    let f = fixture(ShadowPolicy::ServerFirst);
    let asids = [Some(8), None, None, None];
    f.backend.enable_hwgrp(0b11, &asids).unwrap();
    assert_eq!(f.server.routes(0), [8]);
    assert_eq!(f.server.routes(1), [8]);

    // swgid 9 is outside the granted mask.
    assert_eq!(
        f.backend.enable_hwgrp((1 << 2) | (1 << 9), &asids),
        Err(Error::Server(ServerError::PermissionDenied))
    );
    assert!(f.server.routes(2).is_empty());

    f.backend.disable_hwgrp(0b11).unwrap();
    assert!(f.server.routes(0).is_empty());
}

#[test]
fn channel_rejects_second_request() {
    let server = LoopbackServer::new(1, 0..1, 0..1 << 32, 1);
    let chan = CommChannel::new(0);
    let connect = Message::request(Opcode::Connect, DriverContext::default());
    chan.submit(&server, connect).unwrap();
    assert_eq!(chan.submit(&server, connect), Err(Error::ChannelBusy));
    assert_eq!(chan.state(), ChannelState::RequestPending);
    assert!(chan.poll(&server).unwrap());
    let response = chan.take_response().unwrap();
    assert_eq!(response.channel_id, 0);
    assert_eq!(response.status(), Ok(()));
    assert_eq!(chan.state(), ChannelState::Idle);
}

#[test]
fn unsolicited_garbage_is_dropped_on_reset() {
    let server = LoopbackServer::new(1, 0..1, 0..1 << 32, 1);
    let chan = CommChannel::new(0);
    server.push_frame(0, &[0xaa; 17]);
    chan.reset(&server);
    let connect = Message::request(Opcode::Connect, DriverContext::default());
    assert_eq!(chan.call(&server, connect, 1).map(|r| r.msg), Ok(Opcode::Connect as u32));
}
