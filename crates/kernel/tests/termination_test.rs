#[path = "common/machine.rs"]
mod machine;

use std::thread;
use std::time::{Duration, Instant};

use cpu::Op;
use kernel::{CommandType, HipcMessage, HleEvent, HleReply, KernelEvent, SvcId};
use machine::{handle_list, script, svc_with, Machine, SCRATCH, TIMEOUT};
use types::ResultCode;

const FOREVER: u64 = u64::MAX;
const PORT_NAME: u64 = SCRATCH + 0x10;

fn id(svc: SvcId) -> u32 {
    svc.into()
}

fn rc(code: ResultCode) -> u64 {
    code.raw() as u64
}

fn empty_request() -> Vec<u8> {
    HipcMessage {
        command_type: CommandType::Request.into(),
        ..Default::default()
    }
    .encode()
    .unwrap()
}

/// Blocks until something was recorded under `tag`, then gives the guest
/// a moment to reach the supervisor call that follows.
fn wait_for_record(m: &Machine, tag: &str) {
    let deadline = Instant::now() + TIMEOUT;
    while m.trace.tagged(tag).is_empty() {
        assert!(Instant::now() < deadline, "nothing recorded as {}", tag);
        thread::sleep(Duration::from_millis(2));
    }
    thread::sleep(Duration::from_millis(20));
}

fn saw_exit(m: &Machine, pid: u64) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while let Some(left) = deadline.checked_duration_since(Instant::now()) {
        match m.kernel.next_event(left) {
            Some(KernelEvent::ProcessExited { pid: p }) if p == pid => return true,
            Some(_) => continue,
            None => return false,
        }
    }
    false
}

/// Stores `name` at TLS + PORT_NAME and points x1 at it.
fn port_name(s: &mut cpu::Script, name: &str) {
    let mut bytes = name.as_bytes().to_vec();
    bytes.push(0);
    s.op(Op::Tls { dst: 28 })
        .op(Op::StoreBytes { base: 28, offset: PORT_NAME, data: bytes })
        .op(Op::Add { dst: 1, src: 28, imm: PORT_NAME });
}

#[test]
fn killed_client_drops_its_queued_request() {
    let m = Machine::new(2);

    // server: accepts one session, naps, then looks at the session
    let mut server = script(0x1000);
    port_name(&mut server, "srv");
    server.set(2, 4).op(Op::Svc { id: id(SvcId::ManageNamedPort) });
    server.mov(19, 1).record("listen", &[0]);
    handle_list(&mut server, 19);
    svc_with(&mut server, id(SvcId::ReplyAndReceive), &[], &[(2, 1), (3, 0), (4, FOREVER)]);
    svc_with(&mut server, id(SvcId::AcceptSession), &[(1, 19)], &[]);
    server.mov(20, 1).record("accept", &[0]);
    server.set(0, 300_000_000).op(Op::Svc { id: id(SvcId::SleepThread) });
    handle_list(&mut server, 20);
    svc_with(&mut server, id(SvcId::ReplyAndReceive), &[], &[(2, 1), (3, 0), (4, FOREVER)]);
    server.record("receive", &[0]);
    server.svc(id(SvcId::ExitProcess), &[]);

    let mut client = script(0x2000);
    port_name(&mut client, "srv");
    client.op(Op::Svc { id: id(SvcId::ConnectToNamedPort) });
    client.mov(19, 1).record("connect", &[0]);
    client.op(Op::StoreBytes { base: 28, offset: 0, data: empty_request() });
    client.record("sending", &[]);
    svc_with(&mut client, id(SvcId::SendSyncRequest), &[(0, 19)], &[]);
    client.record("sent", &[0]);
    client.svc(id(SvcId::ExitProcess), &[]);

    let server_pid = m.spawn(server);
    wait_for_record(&m, "listen");
    let client_pid = m.spawn(client);
    wait_for_record(&m, "sending");

    m.kernel.terminate_process(client_pid).unwrap();
    assert!(saw_exit(&m, client_pid));
    m.run_to_exit(server_pid);

    assert_eq!(m.values("listen"), vec![vec![0]]);
    assert_eq!(m.values("connect"), vec![vec![0]]);
    assert_eq!(m.values("accept"), vec![vec![0]]);
    assert!(m.values("sent").is_empty());
    // the request left with its sender; only the closed client remains
    assert_eq!(m.values("receive"), vec![vec![rc(ResultCode::SESSION_CLOSED)]]);
}

#[test]
fn killed_waiter_never_wakes() {
    let m = Machine::new(1);
    let mut main = script(0);
    main.svc(id(SvcId::CreateEvent), &[]).mov(20, 2);
    handle_list(&mut main, 20);
    main.record("waiting", &[]);
    svc_with(&mut main, id(SvcId::WaitSynchronization), &[], &[(2, 1), (3, FOREVER)]);
    main.record("woke", &[0]);
    main.svc(id(SvcId::ExitProcess), &[]);

    let pid = m.spawn(main);
    wait_for_record(&m, "waiting");
    m.kernel.terminate_process(pid).unwrap();

    assert!(saw_exit(&m, pid));
    assert!(!m.kernel.process_ids().contains(&pid));
    assert!(m.values("woke").is_empty());
}

#[test]
fn reply_to_a_killed_client_is_discarded() {
    let m = Machine::new(1);
    let port = m.kernel.create_hle_port("test:k", 4);
    m.kernel.register_named_port("test:k", &port).unwrap();

    let mut main = script(0);
    port_name(&mut main, "test:k");
    main.op(Op::Svc { id: id(SvcId::ConnectToNamedPort) }).mov(19, 1);
    main.op(Op::StoreBytes { base: 28, offset: 0, data: empty_request() });
    svc_with(&mut main, id(SvcId::SendSyncRequest), &[(0, 19)], &[]);
    main.record("sent", &[0]);
    main.svc(id(SvcId::ExitProcess), &[]);
    let pid = m.spawn(main);

    let event = m.kernel.next_hle_event(TIMEOUT).expect("request");
    let HleEvent::Request(req) = event else {
        panic!("expected a request, got {:?}", event);
    };
    m.kernel.terminate_process(pid).unwrap();
    assert!(saw_exit(&m, pid));

    let reply = HipcMessage {
        command_type: CommandType::Request.into(),
        copy_handles: vec![0],
        ..Default::default()
    };
    let delivered = m.kernel.reply_hle(
        req.id,
        HleReply {
            message: reply.encode().unwrap(),
            copy_objects: vec![port.clone()],
            ..Default::default()
        },
    );
    assert_eq!(delivered, Ok(()));
    match m.kernel.next_hle_event(TIMEOUT) {
        Some(HleEvent::SessionClosed(session)) => assert_eq!(session, req.session),
        other => panic!("expected the session to close, got {:?}", other),
    }
    assert!(m.values("sent").is_empty());
    drop(port);
}
