#[path = "common/machine.rs"]
mod machine;

use std::time::Duration;

use cpu::{HaltReason, Op};
use kernel::{
    CommandType, FatalKind, HipcMessage, HleEvent, HleReply, KernelConfig, KernelEvent,
    ProcessParams, ResourceLimitValues, SvcId,
};
use machine::{handle_list, script, small_pools, svc_with, Machine, SCRATCH, TIMEOUT};
use types::ResultCode;

fn id(svc: SvcId) -> u32 {
    svc.into()
}

fn rc(code: ResultCode) -> u64 {
    code.raw() as u64
}

const ANY_CORE: u64 = (-2i64) as u64;
const FOREVER: u64 = u64::MAX;

#[test]
fn thread_creation_stops_at_the_resource_limit() {
    let m = Machine::new(1);
    let mut worker = script(0x1000);
    worker.record("worker", &[0]);
    let worker_entry = m.book.add(worker);

    let mut main = script(0);
    main.svc(id(SvcId::CreateThread), &[0, worker_entry, 7, 0, 50, ANY_CORE])
        .record("first", &[0]);
    main.svc(id(SvcId::CreateThread), &[0, worker_entry, 7, 0, 50, ANY_CORE])
        .record("second", &[0]);
    main.svc(id(SvcId::ExitProcess), &[]);

    let limits = ResourceLimitValues {
        threads: 2,
        ..Default::default()
    };
    let pid = m.spawn_with_limits(main, Some(limits));
    m.run_to_exit(pid);

    assert_eq!(m.values("first"), vec![vec![0]]);
    assert_eq!(m.values("second"), vec![vec![rc(ResultCode::LIMIT_REACHED)]]);
    // created but never started
    assert!(m.values("worker").is_empty());
}

#[test]
fn closing_a_handle_twice_fails() {
    let m = Machine::new(1);
    let mut main = script(0);
    main.svc(id(SvcId::CreateEvent), &[]).mov(19, 1).mov(20, 2);
    svc_with(&mut main, id(SvcId::CloseHandle), &[(0, 19)], &[]);
    main.record("close", &[0]);
    svc_with(&mut main, id(SvcId::CloseHandle), &[(0, 19)], &[]);
    main.record("close", &[0]);
    // the readable side is still open
    svc_with(&mut main, id(SvcId::ClearEvent), &[(0, 20)], &[]);
    main.record("clear", &[0]);
    main.svc(id(SvcId::ExitProcess), &[]);

    let pid = m.spawn(main);
    m.run_to_exit(pid);
    assert_eq!(
        m.values("close"),
        vec![vec![0], vec![rc(ResultCode::INVALID_HANDLE)]]
    );
    assert_eq!(m.values("clear"), vec![vec![0]]);
}

#[test]
fn duplicate_outlives_the_original() {
    let m = Machine::new(1);
    let pid = m
        .kernel
        .create_process(&ProcessParams::default())
        .expect("create process");
    let original = m
        .kernel
        .with_state(|state| {
            let process = state.process_by_pid(pid)?;
            state.add_handle(process, process)
        })
        .expect("add handle");

    let copy = m.kernel.duplicate_handle(pid, original).expect("duplicate");
    assert_ne!(copy, original);
    assert_eq!(m.kernel.close_handle(pid, original), Ok(()));
    assert_eq!(m.kernel.close_handle(pid, original), Err(ResultCode::INVALID_HANDLE));
    assert_eq!(
        m.kernel.duplicate_handle(pid, original),
        Err(ResultCode::INVALID_HANDLE)
    );
    assert!(m.kernel.duplicate_handle(pid, copy).is_ok());
    m.kernel.terminate_process(pid).expect("terminate");
}

/// Waits on the readable event handle passed as the thread argument, then
/// records `tag`.
fn waiter(offset: u64, tag: &str) -> cpu::Script {
    let mut s = script(offset);
    s.mov(19, 0);
    handle_list(&mut s, 19);
    svc_with(&mut s, id(SvcId::WaitSynchronization), &[], &[(2, 1), (3, FOREVER)]);
    s.record(tag, &[0, 1]);
    s
}

#[test]
fn signaled_event_wakes_the_most_urgent_waiter_first() {
    let m = Machine::new(1);
    let low = m.book.add(waiter(0x1000, "low"));
    let high = m.book.add(waiter(0x2000, "high"));

    let mut main = script(0);
    main.svc(id(SvcId::CreateEvent), &[]).mov(19, 1).mov(20, 2);
    for (entry, priority, reg) in [(low, 40, 21), (high, 30, 22)] {
        main.set(1, entry).set(3, 0).set(4, priority).set(5, ANY_CORE);
        svc_with(&mut main, id(SvcId::CreateThread), &[(2, 20)], &[]);
        main.mov(reg, 1);
        svc_with(&mut main, id(SvcId::StartThread), &[(0, reg)], &[]);
    }
    main.record("signal", &[]);
    svc_with(&mut main, id(SvcId::SignalEvent), &[(0, 19)], &[]);
    main.record("main", &[0]);
    main.svc(id(SvcId::ExitProcess), &[]);

    let pid = m.spawn(main);
    m.run_to_exit(pid);

    assert_eq!(m.values("high"), vec![vec![0, 0]]);
    assert_eq!(m.values("low"), vec![vec![0, 0]]);
    let order: Vec<String> = m
        .trace
        .tags()
        .into_iter()
        .filter(|t| t != "signal")
        .collect();
    assert_eq!(order, vec!["high", "low", "main"]);
}

#[test]
fn wait_times_out_on_an_unsignaled_event() {
    let m = Machine::new(1);
    let mut main = script(0);
    main.svc(id(SvcId::CreateEvent), &[]).mov(20, 2);
    handle_list(&mut main, 20);
    svc_with(&mut main, id(SvcId::WaitSynchronization), &[], &[(2, 1), (3, 1_000_000)]);
    main.record("wait", &[0]);
    handle_list(&mut main, 20);
    svc_with(&mut main, id(SvcId::WaitSynchronization), &[], &[(2, 1), (3, 0)]);
    main.record("poll", &[0]);
    main.svc(id(SvcId::ExitProcess), &[]);

    let pid = m.spawn(main);
    m.run_to_exit(pid);
    assert_eq!(m.values("wait"), vec![vec![rc(ResultCode::TIMED_OUT)]]);
    assert_eq!(m.values("poll"), vec![vec![rc(ResultCode::TIMED_OUT)]]);
}

#[test]
fn heap_is_usable_until_shrunk() {
    let m = Machine::new(1);
    let mut main = script(0);
    main.svc(id(SvcId::SetHeapSize), &[0, 0x20_0000]).mov(19, 1).record("heap", &[0]);
    main.set(20, 0xC0FFEE)
        .op(Op::Store64 { base: 19, offset: 0x1_0000, src: 20 })
        .op(Op::Load64 { dst: 21, base: 19, offset: 0x1_0000 })
        .record("load", &[21]);
    main.svc(id(SvcId::SetHeapSize), &[0, 0]).record("shrink", &[0]);
    main.op(Op::Load64 { dst: 21, base: 19, offset: 0x1_0000 });

    let pid = m.spawn(main);
    m.run_to_exit(pid);
    assert_eq!(m.values("heap"), vec![vec![0]]);
    assert_eq!(m.values("load"), vec![vec![0xC0FFEE]]);
    assert_eq!(m.values("shrink"), vec![vec![0]]);
    match m.next_fatal() {
        Some(KernelEvent::Fatal { pid: p, kind, .. }) => {
            assert_eq!(p, pid);
            assert!(matches!(kind, FatalKind::Fault(HaltReason::DataAbort { .. })));
        }
        other => panic!("expected a data abort, got {:?}", other),
    }
}

#[test]
fn unknown_supervisor_call_kills_the_process() {
    let m = Machine::new(1);
    let mut main = script(0);
    main.svc(0x99, &[]).record("after", &[]);

    let pid = m.spawn(main);
    m.run_to_exit(pid);
    assert!(m.values("after").is_empty());
    match m.next_fatal() {
        Some(KernelEvent::Fatal { pid: p, kind, .. }) => {
            assert_eq!(p, pid);
            assert_eq!(kind, FatalKind::UnknownSvc(0x99));
        }
        other => panic!("expected a fatal report, got {:?}", other),
    }
}

#[test]
fn guest_request_reaches_a_host_port_and_gets_the_reply() {
    let m = Machine::new(2);
    let port = m.kernel.create_hle_port("test:x", 4);
    m.kernel.register_named_port("test:x", &port).unwrap();

    let request = HipcMessage {
        command_type: CommandType::Request.into(),
        raw: 0xAABB_CCDDu32.to_le_bytes().to_vec(),
        ..Default::default()
    }
    .encode()
    .unwrap();

    let mut main = script(0);
    main.op(Op::Tls { dst: 28 })
        .op(Op::StoreBytes { base: 28, offset: SCRATCH, data: b"test:x\0".to_vec() })
        .op(Op::Add { dst: 1, src: 28, imm: SCRATCH })
        .op(Op::Svc { id: id(SvcId::ConnectToNamedPort) })
        .mov(19, 1)
        .record("connect", &[0]);
    main.op(Op::StoreBytes { base: 28, offset: 0, data: request });
    svc_with(&mut main, id(SvcId::SendSyncRequest), &[(0, 19)], &[]);
    main.record("send", &[0])
        .op(Op::RecordMemory { tag: "reply".into(), base: 28, offset: 0, len: 0x10 });
    svc_with(&mut main, id(SvcId::CloseHandle), &[(0, 19)], &[]);
    main.svc(id(SvcId::ExitProcess), &[]);
    let pid = m.spawn(main);

    let event = m.kernel.next_hle_event(TIMEOUT).expect("request");
    let HleEvent::Request(req) = event else {
        panic!("expected a request, got {:?}", event);
    };
    assert_eq!(req.port.as_deref(), Some("test:x"));
    assert_eq!(req.pid, pid);
    let msg = HipcMessage::parse(&req.message).unwrap();
    assert_eq!(msg.raw, 0xAABB_CCDDu32.to_le_bytes().to_vec());

    let reply = HipcMessage {
        command_type: CommandType::Request.into(),
        raw: 0x1122_3344u32.to_le_bytes().to_vec(),
        ..Default::default()
    };
    m.kernel
        .reply_hle(
            req.id,
            HleReply {
                message: reply.encode().unwrap(),
                ..Default::default()
            },
        )
        .unwrap();

    match m.kernel.next_hle_event(TIMEOUT) {
        Some(HleEvent::SessionClosed(session)) => assert_eq!(session, req.session),
        other => panic!("expected the session to close, got {:?}", other),
    }
    m.run_to_exit(pid);
    assert_eq!(m.values("connect"), vec![vec![0]]);
    assert_eq!(m.values("send"), vec![vec![0]]);
    let reply_bytes = &m.trace.tagged("reply")[0].bytes;
    assert_eq!(&reply_bytes[8..12], &0x1122_3344u32.to_le_bytes());
    drop(port);
}

/// Connects to the named port whose name is stored at TLS + SCRATCH and
/// records the result under `tag`.
fn connect_named(s: &mut cpu::Script, tag: &str) {
    s.op(Op::Add { dst: 1, src: 28, imm: SCRATCH })
        .op(Op::Svc { id: id(SvcId::ConnectToNamedPort) })
        .record(tag, &[0]);
}

#[test]
fn reply_that_overflows_the_handle_table_installs_nothing() {
    // the main thread handle and the session leave exactly one free slot
    let m = Machine::with_config(KernelConfig {
        num_cores: 1,
        handle_table_size: 3,
        pool_sizes: small_pools(),
        ..Default::default()
    });
    let port = m.kernel.create_hle_port("test:h", 4);
    m.kernel.register_named_port("test:h", &port).unwrap();

    let request = HipcMessage {
        command_type: CommandType::Request.into(),
        ..Default::default()
    }
    .encode()
    .unwrap();
    let mut main = script(0);
    main.op(Op::Tls { dst: 28 })
        .op(Op::StoreBytes { base: 28, offset: SCRATCH, data: b"test:h\0".to_vec() });
    connect_named(&mut main, "connect");
    main.mov(19, 1)
        .op(Op::StoreBytes { base: 28, offset: 0, data: request });
    svc_with(&mut main, id(SvcId::SendSyncRequest), &[(0, 19)], &[]);
    main.record("send", &[0]);
    connect_named(&mut main, "reconnect");
    main.svc(id(SvcId::ExitProcess), &[]);
    let pid = m.spawn(main);

    let event = m.kernel.next_hle_event(TIMEOUT).expect("request");
    let HleEvent::Request(req) = event else {
        panic!("expected a request, got {:?}", event);
    };
    let reply = HipcMessage {
        command_type: CommandType::Request.into(),
        copy_handles: vec![0, 0],
        ..Default::default()
    };
    m.kernel
        .reply_hle(
            req.id,
            HleReply {
                message: reply.encode().unwrap(),
                copy_objects: vec![port.clone(), port.clone()],
                ..Default::default()
            },
        )
        .unwrap();

    m.run_to_exit(pid);
    assert_eq!(m.values("connect"), vec![vec![0]]);
    assert_eq!(m.values("send"), vec![vec![rc(ResultCode::OUT_OF_HANDLES)]]);
    // the slot the first copy took was given back
    assert_eq!(m.values("reconnect"), vec![vec![0]]);
    drop(port);
}

#[test]
fn shutdown_stops_idle_cores() {
    let m = Machine::new(4);
    std::thread::sleep(Duration::from_millis(20));
    m.kernel.shutdown();
    assert!(m.kernel.is_shut_down());
    assert!(m.kernel.next_hle_event(Duration::from_millis(10)).is_none());
}
