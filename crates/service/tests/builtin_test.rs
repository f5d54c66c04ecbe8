#[path = "common/guest.rs"]
mod guest;

use cpu::{Op, Script};
use guest::{connect, exit, request, script, take_reply_handle, Guest, DATA};
use kernel::{BufferDescriptor, CommandType, FatalKind, HipcMessage, KernelEvent};
use service::cmif::{encode_request, simple_request};
use service::manager::encode_name;
use service::services::{hid, lm};
use service::{register_builtin, BuiltinServices, ServicesConfig};
use types::result::sm;
use types::ResultCode;

fn builtin() -> (Guest, BuiltinServices) {
    let guest = Guest::new();
    let services = register_builtin(&guest.manager, &ServicesConfig::default()).unwrap();
    (guest, services)
}

fn get_service(name: &str) -> Vec<u8> {
    simple_request(CommandType::Request, 1, &encode_name(name).unwrap().to_le_bytes()).unwrap()
}

fn command(id: u32, payload: &[u8]) -> Vec<u8> {
    simple_request(CommandType::Request, id, payload).unwrap()
}

/// Connects to `sm:`, initializes it, and opens `name` into `dst`.
fn open_service(main: &mut Script, name: &str, dst: usize) {
    connect(main, "sm:", 19);
    request(main, 19, command(0, &[]), "initialize");
    request(main, 19, get_service(name), "get service");
    take_reply_handle(main, dst);
}

#[test]
fn every_builtin_is_registered() {
    let (g, _services) = builtin();
    for name in ["sm:", "fatal:u", "lm", "acc:u0", "hid"] {
        assert!(g.manager.is_registered(name), "{} missing", name);
    }
}

#[test]
fn sm_refuses_clients_that_did_not_initialize() {
    let (mut g, _services) = builtin();
    let mut main = script();
    connect(&mut main, "sm:", 19);
    request(&mut main, 19, get_service("acc:u0"), "early");
    request(&mut main, 19, command(0, &[]), "initialize");
    request(&mut main, 19, get_service("nothere"), "missing");
    exit(&mut main);
    let pid = g.spawn(main, &[]);

    g.serve(3);
    g.run_to_exit(pid);
    assert_eq!(g.values("connect sm:"), vec![vec![0]]);
    assert_eq!(g.reply("early reply").result, sm::INVALID_CLIENT);
    assert!(g.reply("initialize reply").result.is_success());
    assert_eq!(g.reply("missing reply").result, sm::NOT_REGISTERED);
}

#[test]
fn service_opened_through_sm_answers_requests() {
    let (mut g, _services) = builtin();
    let mut main = script();
    open_service(&mut main, "acc:u0", 20);
    request(&mut main, 20, command(0, &[]), "count");
    exit(&mut main);
    let pid = g.spawn(main, &[]);

    g.serve(3);
    g.run_to_exit(pid);
    let opened = g.reply("get service reply");
    assert!(opened.result.is_success());
    assert_eq!(opened.move_handles.len(), 1);
    assert_eq!(&g.reply("count reply").payload[..4], &1u32.to_le_bytes());
}

#[test]
fn account_list_fills_the_output_buffer() {
    let (mut g, _services) = builtin();
    let list = HipcMessage {
        command_type: CommandType::Request.into(),
        b_buffers: vec![BufferDescriptor {
            address: DATA,
            size: 0x80,
            attribute: 0,
        }],
        ..Default::default()
    };
    let mut main = script();
    open_service(&mut main, "acc:u0", 20);
    request(&mut main, 20, encode_request(list, 2, &[]).unwrap(), "list");
    // read back the buffer before the process and its memory go away
    main.set(21, DATA).op(Op::RecordMemory {
        tag: "users".into(),
        base: 21,
        offset: 0,
        len: 0x20,
    });
    exit(&mut main);
    let pid = g.spawn(main, &[0xEE; 0x80]);

    g.serve(3);
    g.run_to_exit(pid);
    assert!(g.reply("list reply").result.is_success());
    let written = g.trace.tagged("users");
    assert_eq!(written.len(), 1);
    let first = ServicesConfig::default().users[0].uuid;
    assert_eq!(&written[0].bytes[..16], &first);
    assert_eq!(&written[0].bytes[16..32], &[0u8; 16]);
}

#[test]
fn thrown_fatal_becomes_a_kernel_event() {
    let (mut g, _services) = builtin();
    let thrown = ResultCode::from_raw(0x1234);
    let mut main = script();
    open_service(&mut main, "fatal:u", 20);
    request(&mut main, 20, command(0, &thrown.raw().to_le_bytes()), "throw");
    exit(&mut main);
    let pid = g.spawn(main, &[]);

    g.serve(3);
    loop {
        match g.kernel.next_event(guest::TIMEOUT) {
            Some(KernelEvent::Fatal { pid: p, kind, .. }) => {
                assert_eq!(p, pid);
                assert_eq!(kind, FatalKind::Service(thrown));
                break;
            }
            Some(_) => continue,
            None => panic!("no fatal reported"),
        }
    }
}

fn log_packet(text: &str) -> Vec<u8> {
    let mut payload = vec![2u8, text.len() as u8];
    payload.extend_from_slice(text.as_bytes());
    let mut packet = Vec::new();
    packet.extend_from_slice(&0u64.to_le_bytes());
    packet.extend_from_slice(&0u64.to_le_bytes());
    packet.extend_from_slice(&3u16.to_le_bytes());
    packet.push(1);
    packet.push(0);
    packet.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    packet.extend_from_slice(&payload);
    packet
}

#[test]
fn guest_log_lines_reach_the_sink() {
    let (mut g, services) = builtin();
    let packet = log_packet("hello from the guest");
    let log = HipcMessage {
        command_type: CommandType::Request.into(),
        a_buffers: vec![BufferDescriptor {
            address: DATA,
            size: packet.len() as u64,
            attribute: 0,
        }],
        ..Default::default()
    };
    let mut main = script();
    open_service(&mut main, lm::NAME, 20);
    request(&mut main, 20, command(0, &0u64.to_le_bytes()), "open logger");
    take_reply_handle(&mut main, 21);
    request(&mut main, 21, encode_request(log, 0, &[]).unwrap(), "log");
    exit(&mut main);
    let pid = g.spawn(main, &packet);

    g.serve(4);
    g.run_to_exit(pid);
    assert!(g.reply("log reply").result.is_success());
    let entries = services.log.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].pid, pid);
    assert_eq!(entries[0].message, "hello from the guest");
}

#[test]
fn hid_hands_out_its_shared_memory() {
    let (mut g, services) = builtin();
    let mut main = script();
    open_service(&mut main, hid::NAME, 20);
    request(&mut main, 20, command(0, &0u64.to_le_bytes()), "applet resource");
    take_reply_handle(&mut main, 21);
    request(&mut main, 21, command(0, &[]), "shared memory");
    request(&mut main, 20, command(100, &0x1Fu32.to_le_bytes()), "set styles");
    request(&mut main, 20, command(103, &[]), "activate");
    exit(&mut main);
    let pid = g.spawn(main, &[]);

    g.serve(6);
    g.run_to_exit(pid);
    let shm = g.reply("shared memory reply");
    assert!(shm.result.is_success());
    assert_eq!(shm.copy_handles.len(), 1);
    assert_ne!(shm.copy_handles[0], 0);
    assert_eq!(services.hid.supported_styles(), 0x1F);

    // sample counter, buttons, sticks, then the connected flag
    let mut entry = [0u8; 0x24];
    g.kernel
        .read_shared_memory(services.hid.shared_memory(), hid::NPAD_OFFSET, &mut entry)
        .unwrap();
    assert_eq!(&entry[..8], &1u64.to_le_bytes());
    assert_eq!(&entry[0x20..0x24], &1u32.to_le_bytes());
}
