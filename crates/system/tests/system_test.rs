use std::sync::Arc;
use std::time::Duration;

use cpu::{Op, Script, ScriptBook, ScriptedExecutorFactory, Trace};
use kernel::{FatalKind, KernelEvent, SvcId};
use memory::{AddressSpaceLayout, PoolSizes};
use once_cell::sync::Lazy;
use service::cmif::simple_request;
use service::manager::encode_name;
use system::{ConfigError, LoaderError, ProgramImage, System, SystemConfig, SystemError};
use types::{MemoryPermission, ResultCode};

const TIMEOUT: Duration = Duration::from_secs(5);
const CODE: u64 = AddressSpaceLayout::CODE_START;

const PF_X: u32 = 1;
const PF_W: u32 = 2;
const PF_R: u32 = 4;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;

struct ElfSegment {
    vaddr: u64,
    flags: u32,
    data: Vec<u8>,
    memsz: u64,
}

/// Minimal little-endian ELF64 for AArch64 with program headers only.
fn build_elf(e_type: u16, entry: u64, segments: &[ElfSegment]) -> Vec<u8> {
    let phoff = 64u64;
    let data_start = phoff + 56 * segments.len() as u64;
    let mut out = Vec::new();
    out.extend_from_slice(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0]);
    out.extend_from_slice(&[0; 8]);
    out.extend_from_slice(&e_type.to_le_bytes());
    out.extend_from_slice(&0xB7u16.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&entry.to_le_bytes());
    out.extend_from_slice(&phoff.to_le_bytes());
    out.extend_from_slice(&0u64.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());
    out.extend_from_slice(&64u16.to_le_bytes());
    out.extend_from_slice(&56u16.to_le_bytes());
    out.extend_from_slice(&(segments.len() as u16).to_le_bytes());
    out.extend_from_slice(&64u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());

    let mut offset = data_start;
    for s in segments {
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&s.flags.to_le_bytes());
        out.extend_from_slice(&offset.to_le_bytes());
        out.extend_from_slice(&s.vaddr.to_le_bytes());
        out.extend_from_slice(&s.vaddr.to_le_bytes());
        out.extend_from_slice(&(s.data.len() as u64).to_le_bytes());
        out.extend_from_slice(&s.memsz.to_le_bytes());
        out.extend_from_slice(&0x1000u64.to_le_bytes());
        offset += s.data.len() as u64;
    }
    for s in segments {
        out.extend_from_slice(&s.data);
    }
    out
}

fn text_and_data() -> Vec<ElfSegment> {
    vec![
        ElfSegment {
            vaddr: 0,
            flags: PF_R | PF_X,
            data: vec![0xAA; 0x40],
            memsz: 0x40,
        },
        ElfSegment {
            vaddr: 0x2010,
            flags: PF_R | PF_W,
            data: vec![0xBB; 0x10],
            memsz: 0x1800,
        },
    ]
}

fn small_config() -> SystemConfig {
    let mut config = SystemConfig::default();
    config.kernel.num_cores = 2;
    config.kernel.pool_sizes = PoolSizes {
        application: 0x100_0000,
        applet: 0x10_0000,
        system: 0x40_0000,
        system_non_secure: 0x10_0000,
    };
    config
}

fn system() -> (System, ScriptBook, Trace) {
    let book = ScriptBook::new();
    let trace = Trace::new();
    let factory = ScriptedExecutorFactory::new(book.clone(), trace.clone());
    let system = System::new(small_config(), Arc::new(factory)).unwrap();
    (system, book, trace)
}

struct ConfigCase {
    name: &'static str,
    json: &'static str,
    valid: bool,
}

static CONFIG_CASES: Lazy<Vec<ConfigCase>> = Lazy::new(|| {
    vec![
        ConfigCase { name: "empty object", json: "{}", valid: true },
        ConfigCase {
            name: "partial kernel section",
            json: r#"{"kernel": {"num_cores": 2, "aslr_seed": 7}}"#,
            valid: true,
        },
        ConfigCase {
            name: "users",
            json: r#"{"services": {"users": [{"uuid": "0123456789abcdef0123456789abcdef", "nickname": "p1"}]}}"#,
            valid: true,
        },
        ConfigCase { name: "no cores", json: r#"{"kernel": {"num_cores": 0}}"#, valid: false },
        ConfigCase { name: "too many cores", json: r#"{"kernel": {"num_cores": 8}}"#, valid: false },
        ConfigCase { name: "zero quantum", json: r#"{"kernel": {"quantum_us": 0}}"#, valid: false },
        ConfigCase {
            name: "zero sessions",
            json: r#"{"services": {"max_sessions": 0}}"#,
            valid: false,
        },
        ConfigCase { name: "not json", json: "kernel = 4", valid: false },
    ]
});

#[test]
fn configuration_documents() {
    for case in CONFIG_CASES.iter() {
        let parsed = SystemConfig::from_json(case.json);
        assert_eq!(parsed.is_ok(), case.valid, "{}: {:?}", case.name, parsed.err());
    }
}

#[test]
fn bad_json_is_a_parse_error() {
    assert!(matches!(SystemConfig::from_json("{"), Err(ConfigError::Parse(_))));
    assert!(matches!(
        SystemConfig::from_json(r#"{"kernel": {"num_cores": 0}}"#),
        Err(ConfigError::Invalid(_))
    ));
}

#[test]
fn position_independent_elf_lands_in_the_code_region() {
    let elf = build_elf(ET_DYN, 0x10, &text_and_data());
    let image = ProgramImage::from_elf("pie", &elf).unwrap();
    assert_eq!(image.entry, CODE + 0x10);
    assert_eq!(image.segments.len(), 2);
    assert_eq!(image.segments[0].addr, CODE);
    assert_eq!(image.segments[0].permission, MemoryPermission::READ_EXECUTE);
    // 0x2010..0x3810 rounds out to two pages
    assert_eq!(image.segments[1].addr, CODE + 0x2000);
    assert_eq!(image.segments[1].size, 0x2000);
    assert_eq!(image.segments[1].permission, MemoryPermission::READ_WRITE);
    assert_eq!(image.segments[1].data.len(), 0x20);
}

#[test]
fn loaded_elf_is_readable_in_the_new_process() {
    let (system, _book, _trace) = system();
    let elf = build_elf(ET_DYN, 0, &text_and_data());
    let pid = system.load_elf("pie", &elf).unwrap();
    let kernel = system.kernel();
    assert_eq!(kernel.read_memory(pid, CODE, 4).unwrap(), vec![0xAA; 4]);
    assert_eq!(kernel.read_memory(pid, CODE + 0x2010, 0x10).unwrap(), vec![0xBB; 0x10]);
    // zero fill past the file contents
    assert_eq!(kernel.read_memory(pid, CODE + 0x2020, 8).unwrap(), vec![0; 8]);
    assert!(kernel.process_ids().contains(&pid));
}

#[test]
fn malformed_elves_are_refused() {
    let mut wx = text_and_data();
    wx[0].flags = PF_R | PF_W | PF_X;
    assert!(matches!(
        ProgramImage::from_elf("wx", &build_elf(ET_DYN, 0, &wx)),
        Err(LoaderError::WritableCode { .. })
    ));

    assert!(matches!(
        ProgramImage::from_elf("entry", &build_elf(ET_DYN, 0x2010, &text_and_data())),
        Err(LoaderError::BadEntry { .. })
    ));

    let mut overlapping = text_and_data();
    overlapping[1].vaddr = 0x20;
    assert!(matches!(
        ProgramImage::from_elf("overlap", &build_elf(ET_DYN, 0, &overlapping)),
        Err(LoaderError::Overlap { .. })
    ));

    let mut truncated = build_elf(ET_DYN, 0, &text_and_data());
    truncated.truncate(truncated.len() - 8);
    assert!(matches!(
        ProgramImage::from_elf("short", &truncated),
        Err(LoaderError::Truncated { .. })
    ));

    assert!(matches!(ProgramImage::from_elf("junk", b"not an elf"), Err(LoaderError::Elf(_))));
    assert!(matches!(
        ProgramImage::from_elf("empty", &build_elf(ET_DYN, 0, &[])),
        Err(LoaderError::Empty)
    ));
}

#[test]
fn fixed_address_elf_keeps_its_addresses() {
    let segments = [ElfSegment {
        vaddr: CODE + 0x10_0000,
        flags: PF_R | PF_X,
        data: vec![1; 8],
        memsz: 8,
    }];
    let image = ProgramImage::from_elf("fixed", &build_elf(ET_EXEC, CODE + 0x10_0000, &segments)).unwrap();
    assert_eq!(image.segments[0].addr, CODE + 0x10_0000);
    assert_eq!(image.entry, CODE + 0x10_0000);
}

#[test]
fn waiting_before_start_is_an_error() {
    let (system, _book, _trace) = system();
    assert!(matches!(
        system.run_until_exit(1, Duration::from_millis(10)),
        Err(SystemError::NotStarted)
    ));
}

#[test]
fn program_runs_to_exit() {
    let (mut system, book, trace) = system();
    let mut main = Script::new(CODE);
    main.record("ran", &[0]).svc(SvcId::ExitProcess.into(), &[]);
    book.add(main);

    system.start().unwrap();
    assert!(matches!(system.start(), Err(SystemError::AlreadyStarted)));
    let pid = system.load_program(&ProgramImage::code_only("main", 0x1000)).unwrap();
    system.run_until_exit(pid, TIMEOUT).unwrap();
    assert_eq!(trace.tagged("ran").len(), 1);
    let events = system.events(Duration::from_millis(50));
    assert!(events.contains(&KernelEvent::ProcessExited { pid }));
}

#[test]
fn fatal_thrown_through_services_surfaces_as_an_event() {
    let (mut system, book, _trace) = system();
    let thrown = ResultCode::from_raw(0x2A02);
    let request = |id: u32, payload: &[u8]| simple_request(kernel::CommandType::Request, id, payload).unwrap();

    let mut main = Script::new(CODE);
    main.op(Op::Tls { dst: 28 })
        .op(Op::StoreBytes { base: 28, offset: 0x100, data: b"sm:\0".to_vec() })
        .op(Op::Add { dst: 1, src: 28, imm: 0x100 })
        .op(Op::Svc { id: SvcId::ConnectToNamedPort.into() })
        .mov(19, 1);
    for message in [
        request(0, &[]),
        request(1, &encode_name("fatal:u").unwrap().to_le_bytes()),
    ] {
        main.op(Op::StoreBytes { base: 28, offset: 0, data: message })
            .mov(0, 19)
            .op(Op::Svc { id: SvcId::SendSyncRequest.into() });
    }
    main.op(Op::Load32 { dst: 20, base: 28, offset: 0x0C })
        .op(Op::StoreBytes { base: 28, offset: 0, data: request(0, &thrown.raw().to_le_bytes()) })
        .mov(0, 20)
        .op(Op::Svc { id: SvcId::SendSyncRequest.into() })
        .svc(SvcId::ExitProcess.into(), &[]);
    book.add(main);

    system.start().unwrap();
    let pid = system.load_program(&ProgramImage::code_only("thrower", 0x1000)).unwrap();
    system.run_until_exit(pid, TIMEOUT).unwrap();
    let fatal = system
        .events(Duration::from_millis(200))
        .into_iter()
        .find_map(|event| match event {
            KernelEvent::Fatal { pid: p, kind, .. } if p == pid => Some(kind),
            _ => None,
        });
    assert_eq!(fatal, Some(FatalKind::Service(thrown)));
}
