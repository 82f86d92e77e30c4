//! End-to-end execution tests: compile a trace, publish it, call into the
//! generated code with a real guest frame, and check both the return value
//! and the flushed frame state.

#![cfg(target_arch = "x86_64")]

use std::sync::atomic::{AtomicU32, Ordering};

use kite_jit::{
    BinOp, CmpKind, CompilerConfig, DecodedInsn, ElemWidth, HelperTable, Opcode, RuntimeHelper,
    SwitchTable, Trace, TraceCompiler, VReg,
};

// =============================================================================
// Test utilities
// =============================================================================

const VREG_BASE: usize = 32;
const SUSPEND_OFFSET: usize = 24;

fn insn(op: Opcode, pc: u32) -> DecodedInsn {
    DecodedInsn::new(op, pc)
}

fn trace(insns: Vec<DecodedInsn>, num_vregs: u16) -> Trace {
    Trace {
        insns,
        entry_pc: 0,
        num_vregs,
        ..Trace::default()
    }
}

fn new_frame() -> Vec<u8> {
    vec![0u8; 512]
}

fn set_vreg(frame: &mut [u8], v: u16, val: u64) {
    let off = VREG_BASE + 8 * v as usize;
    frame[off..off + 8].copy_from_slice(&val.to_le_bytes());
}

fn get_vreg(frame: &[u8], v: u16) -> u64 {
    let off = VREG_BASE + 8 * v as usize;
    u64::from_le_bytes(frame[off..off + 8].try_into().unwrap())
}

fn run_with(config: CompilerConfig, trace: &Trace, frame: &mut [u8]) -> u64 {
    let _ = env_logger::builder().is_test(true).try_init();
    let published = TraceCompiler::new(config)
        .compile(trace)
        .unwrap()
        .publish()
        .unwrap();
    unsafe { (published.entry())(frame.as_mut_ptr()) }
}

fn run(trace: &Trace, frame: &mut [u8]) -> u64 {
    run_with(CompilerConfig::default(), trace, frame)
}

// =============================================================================
// Arithmetic
// =============================================================================

#[test]
fn arithmetic_chain() {
    // ((5 + 7) * 3 - 6) / 2 = 15
    let t = trace(
        vec![
            insn(Opcode::Const, 0).with_regs(VReg(0), VReg(0), VReg(0)).with_imm(5),
            insn(Opcode::BinaryLit(BinOp::Add), 4)
                .with_regs(VReg(1), VReg(0), VReg(0))
                .with_imm(7),
            insn(Opcode::Const, 8).with_regs(VReg(2), VReg(0), VReg(0)).with_imm(3),
            insn(Opcode::Binary(BinOp::Mul), 12).with_regs(VReg(1), VReg(1), VReg(2)),
            insn(Opcode::BinaryLit(BinOp::Sub), 16)
                .with_regs(VReg(1), VReg(1), VReg(0))
                .with_imm(6),
            insn(Opcode::Const, 20).with_regs(VReg(3), VReg(0), VReg(0)).with_imm(2),
            insn(Opcode::Binary(BinOp::Div), 24).with_regs(VReg(1), VReg(1), VReg(3)),
            insn(Opcode::Return, 28).with_regs(VReg(1), VReg(0), VReg(0)),
        ],
        4,
    );
    let mut frame = new_frame();
    assert_eq!(run(&t, &mut frame), 15);
    assert_eq!(get_vreg(&frame, 1), 15);
}

#[test]
fn signed_division_truncates() {
    // Dividend comes from the frame, so the full CQO/IDIV path runs.
    let t = trace(
        vec![
            insn(Opcode::BinaryLit(BinOp::Div), 0)
                .with_regs(VReg(1), VReg(0), VReg(0))
                .with_imm(2),
            insn(Opcode::Return, 4).with_regs(VReg(1), VReg(0), VReg(0)),
        ],
        2,
    );
    let mut frame = new_frame();
    set_vreg(&mut frame, 0, (-7i64) as u64);
    assert_eq!(run(&t, &mut frame) as i64, -3);
}

#[test]
fn remainder_follows_the_dividend_sign() {
    let t = trace(
        vec![
            insn(Opcode::BinaryLit(BinOp::Rem), 0)
                .with_regs(VReg(1), VReg(0), VReg(0))
                .with_imm(3),
            insn(Opcode::Return, 4).with_regs(VReg(1), VReg(0), VReg(0)),
        ],
        2,
    );
    let mut frame = new_frame();
    set_vreg(&mut frame, 0, (-7i64) as u64);
    assert_eq!(run(&t, &mut frame) as i64, -1);
}

#[test]
fn shifts_are_64_bit_with_masked_counts() {
    // (1 << 40) unsigned-shifted right by (68 & 63) = 16.
    let t = trace(
        vec![
            insn(Opcode::Const, 0).with_regs(VReg(0), VReg(0), VReg(0)).with_imm(1),
            insn(Opcode::BinaryLit(BinOp::Shl), 4)
                .with_regs(VReg(1), VReg(0), VReg(0))
                .with_imm(40),
            insn(Opcode::Binary(BinOp::Ushr), 8).with_regs(VReg(1), VReg(1), VReg(2)),
            insn(Opcode::Return, 12).with_regs(VReg(1), VReg(0), VReg(0)),
        ],
        3,
    );
    let mut frame = new_frame();
    set_vreg(&mut frame, 2, 68);
    assert_eq!(run(&t, &mut frame), 1 << 36);
}

#[test]
fn cmp_is_minus_one_zero_one() {
    let t = trace(
        vec![
            insn(Opcode::Cmp, 0).with_regs(VReg(2), VReg(0), VReg(1)),
            insn(Opcode::Return, 4).with_regs(VReg(2), VReg(0), VReg(0)),
        ],
        3,
    );
    for (a, b, want) in [(3i64, 9i64, -1i64), (9, 9, 0), (9, 3, 1), (-5, 2, -1)] {
        let mut frame = new_frame();
        set_vreg(&mut frame, 0, a as u64);
        set_vreg(&mut frame, 1, b as u64);
        assert_eq!(run(&t, &mut frame) as i64, want, "cmp {a} {b}");
    }
}

// =============================================================================
// Control flow
// =============================================================================

#[test]
fn counting_loop_runs_to_completion() {
    // v0 = 0; do { v0 += 1 } while (v0 < v1); return v0
    let t = trace(
        vec![
            insn(Opcode::Const, 0).with_regs(VReg(0), VReg(0), VReg(0)).with_imm(0),
            insn(Opcode::Const, 4).with_regs(VReg(1), VReg(0), VReg(0)).with_imm(100),
            insn(Opcode::BinaryLit(BinOp::Add), 8)
                .with_regs(VReg(0), VReg(0), VReg(0))
                .with_imm(1),
            insn(Opcode::If(CmpKind::Lt), 12)
                .with_regs(VReg(0), VReg(0), VReg(1))
                .with_target(8),
            insn(Opcode::Return, 16).with_regs(VReg(0), VReg(0), VReg(0)),
        ],
        2,
    );
    let mut frame = new_frame();
    assert_eq!(run(&t, &mut frame), 100);
    assert_eq!(get_vreg(&frame, 0), 100);
}

#[test]
fn branch_diamond_picks_a_side() {
    // if (v0 == 0) v1 = 222 else v1 = 111; return v1
    let t = trace(
        vec![
            insn(Opcode::IfZ(CmpKind::Eq), 0)
                .with_regs(VReg(0), VReg(0), VReg(0))
                .with_target(12),
            insn(Opcode::Const, 4).with_regs(VReg(1), VReg(0), VReg(0)).with_imm(111),
            insn(Opcode::Goto, 8).with_regs(VReg(0), VReg(0), VReg(0)).with_target(16),
            insn(Opcode::Const, 12).with_regs(VReg(1), VReg(0), VReg(0)).with_imm(222),
            insn(Opcode::Return, 16).with_regs(VReg(1), VReg(0), VReg(0)),
        ],
        2,
    );
    let mut taken = new_frame();
    assert_eq!(run(&t, &mut taken), 222);
    let mut not_taken = new_frame();
    set_vreg(&mut not_taken, 0, 5);
    assert_eq!(run(&t, &mut not_taken), 111);
}

#[test]
fn packed_switch_dispatches_through_the_table() {
    let t = Trace {
        insns: vec![
            insn(Opcode::PackedSwitch, 0).with_regs(VReg(0), VReg(0), VReg(0)).with_imm(0),
            insn(Opcode::Const, 8).with_regs(VReg(1), VReg(0), VReg(0)).with_imm(10),
            insn(Opcode::Goto, 12).with_regs(VReg(0), VReg(0), VReg(0)).with_target(28),
            insn(Opcode::Const, 16).with_regs(VReg(1), VReg(0), VReg(0)).with_imm(20),
            insn(Opcode::Goto, 20).with_regs(VReg(0), VReg(0), VReg(0)).with_target(28),
            insn(Opcode::Const, 24).with_regs(VReg(1), VReg(0), VReg(0)).with_imm(99),
            insn(Opcode::Return, 28).with_regs(VReg(1), VReg(0), VReg(0)),
        ],
        entry_pc: 0,
        num_vregs: 2,
        switches: vec![SwitchTable {
            first_key: 0,
            keys: vec![],
            targets: vec![8, 16],
            default_target: 24,
        }],
        ..Trace::default()
    };
    for (key, want) in [(0u64, 10u64), (1, 20), (7, 99)] {
        let mut frame = new_frame();
        set_vreg(&mut frame, 0, key);
        assert_eq!(run(&t, &mut frame), want, "switch key {key}");
    }
}

#[test]
fn sparse_switch_matches_exact_keys() {
    let t = Trace {
        insns: vec![
            insn(Opcode::SparseSwitch, 0).with_regs(VReg(0), VReg(0), VReg(0)).with_imm(0),
            insn(Opcode::Const, 8).with_regs(VReg(1), VReg(0), VReg(0)).with_imm(10),
            insn(Opcode::Goto, 12).with_regs(VReg(0), VReg(0), VReg(0)).with_target(24),
            insn(Opcode::Const, 16).with_regs(VReg(1), VReg(0), VReg(0)).with_imm(20),
            insn(Opcode::Goto, 20).with_regs(VReg(0), VReg(0), VReg(0)).with_target(24),
            insn(Opcode::Return, 24).with_regs(VReg(1), VReg(0), VReg(0)),
        ],
        entry_pc: 0,
        num_vregs: 2,
        switches: vec![SwitchTable {
            first_key: 0,
            keys: vec![-100, 4000],
            targets: vec![8, 16],
            default_target: 24,
        }],
        ..Trace::default()
    };
    for (key, want) in [((-100i64) as u64, 10u64), (4000, 20), (5, 0)] {
        let mut frame = new_frame();
        set_vreg(&mut frame, 0, key);
        assert_eq!(run(&t, &mut frame), want, "switch key {key}");
    }
}

// =============================================================================
// Memory: arrays and fields
// =============================================================================

/// Guest array layout: class word at 0, length u32 at 8, elements from 16.
fn make_array(values: &[u64]) -> Vec<u8> {
    let mut buf = vec![0u8; 16 + 8 * values.len()];
    buf[8..12].copy_from_slice(&(values.len() as u32).to_le_bytes());
    for (i, v) in values.iter().enumerate() {
        buf[16 + 8 * i..24 + 8 * i].copy_from_slice(&v.to_le_bytes());
    }
    buf
}

#[test]
fn aget_reads_through_the_guards() {
    let t = trace(
        vec![
            insn(Opcode::AGet(ElemWidth::B8), 0).with_regs(VReg(2), VReg(0), VReg(1)),
            insn(Opcode::Return, 4).with_regs(VReg(2), VReg(0), VReg(0)),
        ],
        3,
    );
    let array = make_array(&[11, 22, 33]);
    let mut frame = new_frame();
    set_vreg(&mut frame, 0, array.as_ptr() as u64);
    set_vreg(&mut frame, 1, 2);
    assert_eq!(run(&t, &mut frame), 33);
}

#[test]
fn aput_writes_the_element() {
    // aput v2 -> v0[v1]
    let t = trace(
        vec![
            insn(Opcode::APut(ElemWidth::B8), 0).with_regs(VReg(2), VReg(0), VReg(1)),
            insn(Opcode::ReturnVoid, 4),
        ],
        3,
    );
    let mut array = make_array(&[0, 0]);
    let mut frame = new_frame();
    set_vreg(&mut frame, 0, array.as_mut_ptr() as u64);
    set_vreg(&mut frame, 1, 1);
    set_vreg(&mut frame, 2, 0xDEAD_BEEF);
    run(&t, &mut frame);
    assert_eq!(
        u64::from_le_bytes(array[24..32].try_into().unwrap()),
        0xDEAD_BEEF
    );
}

#[test]
fn array_length_reads_the_header() {
    let t = trace(
        vec![
            insn(Opcode::ArrayLength, 0).with_regs(VReg(1), VReg(0), VReg(0)),
            insn(Opcode::Return, 4).with_regs(VReg(1), VReg(0), VReg(0)),
        ],
        2,
    );
    let array = make_array(&[1, 2, 3, 4, 5]);
    let mut frame = new_frame();
    set_vreg(&mut frame, 0, array.as_ptr() as u64);
    assert_eq!(run(&t, &mut frame), 5);
}

#[test]
fn instance_fields_round_trip() {
    // iput v1 -> [v0 + 24]; iget v2 <- [v0 + 24]; return v2
    let t = trace(
        vec![
            insn(Opcode::IPut(ElemWidth::B8), 0)
                .with_regs(VReg(1), VReg(0), VReg(0))
                .with_imm(24),
            insn(Opcode::IGet(ElemWidth::B8), 4)
                .with_regs(VReg(2), VReg(0), VReg(0))
                .with_imm(24),
            insn(Opcode::Return, 8).with_regs(VReg(2), VReg(0), VReg(0)),
        ],
        3,
    );
    let mut object = vec![0u8; 64];
    let mut frame = new_frame();
    set_vreg(&mut frame, 0, object.as_mut_ptr() as u64);
    set_vreg(&mut frame, 1, 424242);
    assert_eq!(run(&t, &mut frame), 424242);
}

#[test]
fn sget_loads_through_a_hot_cache_entry() {
    let cell: u64 = 777;
    let cache: Vec<u64> = vec![&cell as *const u64 as u64];
    let t = trace(
        vec![
            insn(Opcode::SGet, 0).with_regs(VReg(0), VReg(0), VReg(0)).with_imm(0),
            insn(Opcode::Return, 4).with_regs(VReg(0), VReg(0), VReg(0)),
        ],
        1,
    );
    let config = CompilerConfig {
        cache_base: cache.as_ptr() as u64,
        ..CompilerConfig::default()
    };
    let mut frame = new_frame();
    assert_eq!(run_with(config, &t, &mut frame), 777);
}

#[test]
fn instance_of_fast_paths() {
    // Class word equal to the cached entry -> 1; null object -> 0.
    let class_tag: u64 = 0x55AA_1234;
    let cache: Vec<u64> = vec![class_tag];
    let mut object = vec![0u8; 16];
    object[0..8].copy_from_slice(&class_tag.to_le_bytes());

    let t = trace(
        vec![
            insn(Opcode::InstanceOf, 0).with_regs(VReg(1), VReg(0), VReg(0)).with_imm(0),
            insn(Opcode::Return, 4).with_regs(VReg(1), VReg(0), VReg(0)),
        ],
        2,
    );
    let config = || CompilerConfig {
        cache_base: cache.as_ptr() as u64,
        ..CompilerConfig::default()
    };

    let mut hit = new_frame();
    set_vreg(&mut hit, 0, object.as_ptr() as u64);
    assert_eq!(run_with(config(), &t, &mut hit), 1);

    let mut null = new_frame();
    assert_eq!(run_with(config(), &t, &mut null), 0);
}

extern "C" fn resolve_string_stub(_frame: *mut u8, _string_idx: i64) -> u64 {
    0xABCD
}

#[test]
fn const_string_commits_the_resolver_result_on_a_cold_slot() {
    // Null cache entry: the miss path calls the resolver and its return
    // value, not the stale null, must reach the destination vreg.
    let cache: Vec<u64> = vec![0];
    let mut helpers = HelperTable::new();
    helpers.set(
        RuntimeHelper::ResolveString,
        resolve_string_stub as usize as u64,
    );
    let t = trace(
        vec![
            insn(Opcode::ConstString, 0).with_regs(VReg(0), VReg(0), VReg(0)).with_imm(0),
            insn(Opcode::Return, 4).with_regs(VReg(0), VReg(0), VReg(0)),
        ],
        1,
    );
    let config = CompilerConfig {
        helpers,
        cache_base: cache.as_ptr() as u64,
        ..CompilerConfig::default()
    };
    let mut frame = new_frame();
    assert_eq!(run_with(config, &t, &mut frame), 0xABCD);
}

static STATIC_CELL: u64 = 777;

extern "C" fn resolve_field_stub(_frame: *mut u8, _field_idx: i64) -> u64 {
    &STATIC_CELL as *const u64 as u64
}

#[test]
fn sget_resolves_a_cold_slot_and_loads_through_it() {
    let cache: Vec<u64> = vec![0];
    let mut helpers = HelperTable::new();
    helpers.set(
        RuntimeHelper::ResolveField,
        resolve_field_stub as usize as u64,
    );
    let t = trace(
        vec![
            insn(Opcode::SGet, 0).with_regs(VReg(0), VReg(0), VReg(0)).with_imm(0),
            insn(Opcode::Return, 4).with_regs(VReg(0), VReg(0), VReg(0)),
        ],
        1,
    );
    let config = CompilerConfig {
        helpers,
        cache_base: cache.as_ptr() as u64,
        ..CompilerConfig::default()
    };
    let mut frame = new_frame();
    assert_eq!(run_with(config, &t, &mut frame), 777);
}

extern "C" fn instance_of_stub(_frame: *mut u8, _obj: u64, _class_idx: i64) -> u64 {
    1
}

#[test]
fn instance_of_slow_path_commits_the_helper_verdict() {
    // Cached class differs from the object's class word, so the exact-match
    // fast path fails and the helper decides.
    let cache: Vec<u64> = vec![0x1111];
    let mut object = vec![0u8; 16];
    object[0..8].copy_from_slice(&0x2222u64.to_le_bytes());

    let mut helpers = HelperTable::new();
    helpers.set(RuntimeHelper::InstanceOf, instance_of_stub as usize as u64);
    let t = trace(
        vec![
            insn(Opcode::InstanceOf, 0).with_regs(VReg(1), VReg(0), VReg(0)).with_imm(0),
            insn(Opcode::Return, 4).with_regs(VReg(1), VReg(0), VReg(0)),
        ],
        2,
    );
    let config = CompilerConfig {
        helpers,
        cache_base: cache.as_ptr() as u64,
        ..CompilerConfig::default()
    };
    let mut frame = new_frame();
    set_vreg(&mut frame, 0, object.as_ptr() as u64);
    assert_eq!(run_with(config, &t, &mut frame), 1);
}

static CAST_CHECKS: AtomicU32 = AtomicU32::new(0);

extern "C" fn check_cast_stub(_frame: *mut u8, _obj: u64, _class_idx: i64) -> u64 {
    CAST_CHECKS.fetch_add(1, Ordering::SeqCst);
    0
}

#[test]
fn check_cast_slow_path_calls_the_helper_and_continues() {
    let cache: Vec<u64> = vec![0x1111];
    let mut object = vec![0u8; 16];
    object[0..8].copy_from_slice(&0x2222u64.to_le_bytes());

    let mut helpers = HelperTable::new();
    helpers.set(RuntimeHelper::CheckCast, check_cast_stub as usize as u64);
    let t = trace(
        vec![
            insn(Opcode::CheckCast, 0).with_regs(VReg(0), VReg(0), VReg(0)).with_imm(0),
            insn(Opcode::Const, 4).with_regs(VReg(1), VReg(0), VReg(0)).with_imm(9),
            insn(Opcode::Return, 8).with_regs(VReg(1), VReg(0), VReg(0)),
        ],
        2,
    );
    let config = CompilerConfig {
        helpers,
        cache_base: cache.as_ptr() as u64,
        ..CompilerConfig::default()
    };
    let mut frame = new_frame();
    set_vreg(&mut frame, 0, object.as_ptr() as u64);
    CAST_CHECKS.store(0, Ordering::SeqCst);
    assert_eq!(run_with(config, &t, &mut frame), 9);
    assert_eq!(CAST_CHECKS.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Runtime helpers
// =============================================================================

extern "C" fn invoke_stub(_frame: *mut u8, method_idx: i64) -> u64 {
    1000 + method_idx as u64
}

#[test]
fn invoke_bridges_through_the_helper() {
    let mut helpers = HelperTable::new();
    helpers.set(RuntimeHelper::InvokeMethod, invoke_stub as usize as u64);
    let t = trace(
        vec![
            insn(Opcode::Invoke, 0).with_regs(VReg(0), VReg(0), VReg(0)).with_imm(5),
            insn(Opcode::Return, 4).with_regs(VReg(0), VReg(0), VReg(0)),
        ],
        1,
    );
    let config = CompilerConfig {
        helpers,
        ..CompilerConfig::default()
    };
    let mut frame = new_frame();
    assert_eq!(run_with(config, &t, &mut frame), 1005);
}

static SUSPEND_HITS: AtomicU32 = AtomicU32::new(0);

extern "C" fn suspend_stub(_frame: *mut u8, _pc: u32) -> u64 {
    SUSPEND_HITS.fetch_add(1, Ordering::SeqCst);
    0
}

#[test]
fn raised_suspend_count_triggers_the_poll() {
    let mut helpers = HelperTable::new();
    helpers.set(RuntimeHelper::Suspend, suspend_stub as usize as u64);
    let t = trace(vec![insn(Opcode::ReturnVoid, 0)], 1);
    let config = CompilerConfig {
        helpers,
        ..CompilerConfig::default()
    };
    let mut frame = new_frame();
    frame[SUSPEND_OFFSET] = 1;
    SUSPEND_HITS.store(0, Ordering::SeqCst);
    run_with(config, &t, &mut frame);
    assert_eq!(SUSPEND_HITS.load(Ordering::SeqCst), 1);
}
