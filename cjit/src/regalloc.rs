//! Linear-scan register allocation.
//!
//! Liveness is a backward sweep iterated to a fixed point over the CFG; no
//! dominance analysis. Intervals are walked in start order; when no
//! register is free the active interval with the farthest end is spilled to
//! a stack slot. Fixed-register constraints (shift counts in `cl`, `idiv`'s
//! rax/rdx, argument registers, the caller-saved kill at calls) are
//! modeled as per-point occupancy masks a candidate register must avoid
//! inside the interval. Spilled values are rewritten through reserved
//! scratch registers (r10/r11, xmm4/xmm5), which are therefore never
//! allocated.

use hashbrown::{HashMap, HashSet};
use itertools::chain;
use tracing::trace;

use cjit_x64::reg::{OpSize, RegClass};

use crate::error::Error;
use crate::mir::{MInst, MOperand, MReg, MirFunction, SlotId, VREG_BASE};
use crate::Result;

/// Allocation order: caller-saved first for short intervals.
const GP_CALLER: [u8; 5] = [0, 1, 2, 8, 9]; // rax rcx rdx r8 r9
const GP_CALLEE: [u8; 7] = [3, 6, 7, 12, 13, 14, 15]; // rbx rsi rdi r12..r15
const GP_SCRATCH: [u8; 2] = [10, 11];
const XMM_CALLER: [u8; 4] = [0, 1, 2, 3];
const XMM_CALLEE: [u8; 10] = [6, 7, 8, 9, 10, 11, 12, 13, 14, 15];
const XMM_SCRATCH: [u8; 2] = [4, 5];

/// Caller-saved register masks, killed at every call site.
const GP_VOLATILE_MASK: u32 = (1 << 0) | (1 << 1) | (1 << 2) | (1 << 8) | (1 << 9) | (1 << 10) | (1 << 11);
const XMM_VOLATILE_MASK: u32 = 0x3F; // xmm0..xmm5

#[derive(Debug, Clone, Copy)]
struct Interval {
    vreg: u32,
    class: RegClass,
    start: u32,
    end: u32,
}

#[derive(Debug, Clone, Copy)]
enum Assignment {
    Phys(u8),
    Spill(SlotId),
}

/// Assign hardware registers to every virtual register in `func`,
/// rewriting the instruction stream in place.
pub fn allocate(func: &mut MirFunction) -> Result<()> {
    let (intervals, fixed_gp, fixed_xmm, call_points) = analyze(func);

    let mut assignment: HashMap<u32, Assignment> = HashMap::new();
    let mut used_callee_gp: HashSet<u8> = HashSet::new();
    let mut used_callee_xmm: HashSet<u8> = HashSet::new();

    // active: (end, vreg, phys)
    let mut active: Vec<(u32, u32, u8, RegClass)> = Vec::new();
    let mut sorted = intervals;
    sorted.sort_by_key(|iv| (iv.start, iv.vreg));

    let occupied_mask = |iv: &Interval, fixed: &[(u32, u32)]| -> u32 {
        let mut mask = 0;
        for &(p, m) in fixed {
            if p > iv.start && p <= iv.end {
                mask |= m;
            }
        }
        mask
    };

    for iv in &sorted {
        active.retain(|&(end, _, _, _)| end >= iv.start);

        let fixed = match iv.class {
            RegClass::Gp => &fixed_gp,
            RegClass::Xmm => &fixed_xmm,
        };
        let mut busy = occupied_mask(iv, fixed);
        for &(_, _, phys, class) in &active {
            if class == iv.class {
                busy |= 1 << phys;
            }
        }

        let crosses_call = call_points
            .iter()
            .any(|&p| p > iv.start && p <= iv.end);
        let candidates: Vec<u8> = match (iv.class, crosses_call) {
            (RegClass::Gp, true) => GP_CALLEE.to_vec(),
            (RegClass::Gp, false) => chain(GP_CALLER, GP_CALLEE).collect(),
            (RegClass::Xmm, true) => XMM_CALLEE.to_vec(),
            (RegClass::Xmm, false) => chain(XMM_CALLER, XMM_CALLEE).collect(),
        };

        let chosen = candidates.iter().copied().find(|&r| busy & (1 << r) == 0);
        match chosen {
            Some(r) => {
                if GP_CALLEE.contains(&r) && iv.class == RegClass::Gp {
                    used_callee_gp.insert(r);
                }
                if XMM_CALLEE.contains(&r) && iv.class == RegClass::Xmm {
                    used_callee_xmm.insert(r);
                }
                assignment.insert(iv.vreg, Assignment::Phys(r));
                active.push((iv.end, iv.vreg, r, iv.class));
                trace!(vreg = iv.vreg, reg = r, "assigned");
            }
            None => {
                // Spill the active interval with the farthest end whose
                // register is usable here; otherwise spill this interval.
                let fixed_busy = occupied_mask(iv, fixed);
                let victim = active
                    .iter()
                    .enumerate()
                    .filter(|(_, (end, _, phys, class))| {
                        *class == iv.class
                            && *end > iv.end
                            && fixed_busy & (1 << *phys) == 0
                            && !(crosses_call
                                && iv.class == RegClass::Gp
                                && !GP_CALLEE.contains(phys))
                            && !(crosses_call
                                && iv.class == RegClass::Xmm
                                && !XMM_CALLEE.contains(phys))
                    })
                    .max_by_key(|(_, (end, _, _, _))| *end)
                    .map(|(i, _)| i);

                match victim {
                    Some(i) => {
                        let (_end, victim_vreg, phys, class) = active.remove(i);
                        let slot = func.new_slot(8, 8);
                        assignment.insert(victim_vreg, Assignment::Spill(slot));
                        assignment.insert(iv.vreg, Assignment::Phys(phys));
                        active.push((iv.end, iv.vreg, phys, class));
                        trace!(vreg = iv.vreg, victim = victim_vreg, "spilled victim");
                    }
                    None => {
                        let slot = func.new_slot(8, 8);
                        assignment.insert(iv.vreg, Assignment::Spill(slot));
                        trace!(vreg = iv.vreg, "spilled");
                    }
                }
            }
        }
    }

    rewrite(func, &assignment)?;

    let mut gp: Vec<u8> = used_callee_gp.into_iter().collect();
    gp.sort_unstable();
    let mut xmm: Vec<u8> = used_callee_xmm.into_iter().collect();
    xmm.sort_unstable();
    func.used_callee_gp = gp;
    func.used_callee_xmm = xmm;
    Ok(())
}

/// Compute live intervals and fixed-register occupancy.
#[allow(clippy::type_complexity)]
fn analyze(
    func: &MirFunction,
) -> (
    Vec<Interval>,
    Vec<(u32, u32)>,
    Vec<(u32, u32)>,
    Vec<u32>,
) {
    let nblocks = func.blocks.len();

    // Global instruction numbering.
    let mut block_range = vec![(0u32, 0u32); nblocks];
    let mut point = 0u32;
    for (b, blk) in func.blocks.iter().enumerate() {
        let start = point;
        point += blk.insts.len() as u32;
        block_range[b] = (start, point);
    }

    // Successors.
    let mut succs: Vec<Vec<usize>> = vec![Vec::new(); nblocks];
    for (b, blk) in func.blocks.iter().enumerate() {
        for inst in &blk.insts {
            match inst {
                MInst::Jmp { target } => succs[b].push(target.index()),
                MInst::Jcc { target, .. } => succs[b].push(target.index()),
                _ => {}
            }
        }
    }

    // Per-block use/def sets over virtual registers.
    let mut uses: Vec<HashSet<u32>> = vec![HashSet::new(); nblocks];
    let mut defs: Vec<HashSet<u32>> = vec![HashSet::new(); nblocks];
    for (b, blk) in func.blocks.iter().enumerate() {
        for inst in &blk.insts {
            inst.visit_uses(&mut |r| {
                if r.is_virtual() && !defs[b].contains(&r.id) {
                    uses[b].insert(r.id);
                }
            });
            inst.visit_defs(&mut |r| {
                if r.is_virtual() {
                    defs[b].insert(r.id);
                }
            });
        }
    }

    // Iterated backward liveness. The CFG is small per function; this
    // converges in a handful of passes.
    let mut live_in: Vec<HashSet<u32>> = vec![HashSet::new(); nblocks];
    let mut live_out: Vec<HashSet<u32>> = vec![HashSet::new(); nblocks];
    let mut changed = true;
    while changed {
        changed = false;
        for b in (0..nblocks).rev() {
            let mut out: HashSet<u32> = HashSet::new();
            for &s in &succs[b] {
                out.extend(live_in[s].iter().copied());
            }
            let mut inn: HashSet<u32> = uses[b].clone();
            for &v in &out {
                if !defs[b].contains(&v) {
                    inn.insert(v);
                }
            }
            if out != live_out[b] || inn != live_in[b] {
                changed = true;
                live_out[b] = out;
                live_in[b] = inn;
            }
        }
    }

    // Intervals plus fixed-register points.
    let mut ivs: HashMap<u32, Interval> = HashMap::new();
    let mut fixed_gp: Vec<(u32, u32)> = Vec::new();
    let mut fixed_xmm: Vec<(u32, u32)> = Vec::new();
    let mut call_points: Vec<u32> = Vec::new();

    let mut extend = |map: &mut HashMap<u32, Interval>, r: &MReg, p: u32| {
        let e = map.entry(r.id).or_insert(Interval {
            vreg: r.id,
            class: r.class,
            start: p,
            end: p,
        });
        e.start = e.start.min(p);
        e.end = e.end.max(p);
    };

    for (b, blk) in func.blocks.iter().enumerate() {
        let (bstart, bend) = block_range[b];
        let bend_point = bend.saturating_sub(1).max(bstart);

        let mut p = bstart;
        for inst in &blk.insts {
            let mut gp_mask = 0u32;
            let mut xmm_mask = 0u32;
            inst.visit_uses(&mut |r| {
                if r.is_virtual() {
                    extend(&mut ivs, r, p);
                } else {
                    match r.class {
                        RegClass::Gp => gp_mask |= 1 << r.id,
                        RegClass::Xmm => xmm_mask |= 1 << r.id,
                    }
                }
            });
            inst.visit_defs(&mut |r| {
                if r.is_virtual() {
                    extend(&mut ivs, r, p);
                } else {
                    match r.class {
                        RegClass::Gp => gp_mask |= 1 << r.id,
                        RegClass::Xmm => xmm_mask |= 1 << r.id,
                    }
                }
            });
            if inst.is_call() {
                gp_mask |= GP_VOLATILE_MASK;
                xmm_mask |= XMM_VOLATILE_MASK;
                call_points.push(p);
            }
            if gp_mask != 0 {
                fixed_gp.push((p, gp_mask));
            }
            if xmm_mask != 0 {
                fixed_xmm.push((p, xmm_mask));
            }
            p += 1;
        }

        // Values live across block boundaries span the whole block.
        for &v in &live_in[b] {
            if let Some(iv) = ivs.get_mut(&v) {
                iv.start = iv.start.min(bstart);
            }
        }
        for &v in &live_out[b] {
            if let Some(iv) = ivs.get_mut(&v) {
                iv.end = iv.end.max(bend_point);
            }
        }
    }

    // A block-live value defined in a later block than one it is live into
    // needs its range widened over the earlier block too.
    for (b, _) in func.blocks.iter().enumerate() {
        let (bstart, bend) = block_range[b];
        let bend_point = bend.saturating_sub(1).max(bstart);
        for &v in live_in[b].union(&live_out[b]) {
            if let Some(iv) = ivs.get_mut(&v) {
                if live_in[b].contains(&v) {
                    iv.start = iv.start.min(bstart);
                }
                if live_out[b].contains(&v) {
                    iv.end = iv.end.max(bend_point);
                }
            }
        }
    }

    (ivs.into_values().collect(), fixed_gp, fixed_xmm, call_points)
}

/// Rewrite virtual registers to their assignments; spilled values go
/// through the reserved scratch registers.
fn rewrite(func: &mut MirFunction, assignment: &HashMap<u32, Assignment>) -> Result<()> {
    let map_reg = |r: &MReg| -> core::result::Result<MReg, SlotId> {
        if !r.is_virtual() {
            return Ok(*r);
        }
        match assignment.get(&r.id) {
            Some(Assignment::Phys(p)) => Ok(MReg {
                id: u32::from(*p),
                class: r.class,
                size: r.size,
            }),
            Some(Assignment::Spill(slot)) => Err(*slot),
            None => Ok(MReg {
                // Dead value that never got an interval; park it in a
                // scratch register.
                id: u32::from(match r.class {
                    RegClass::Gp => GP_SCRATCH[0],
                    RegClass::Xmm => XMM_SCRATCH[0],
                }),
                class: r.class,
                size: r.size,
            }),
        }
    };

    for blk in func.blocks.iter_mut() {
        let old = core::mem::take(&mut blk.insts);
        let mut out = Vec::with_capacity(old.len());
        for inst in old {
            // Map spilled vregs in this instruction to scratch registers.
            let mut spill_map: HashMap<u32, (MReg, SlotId)> = HashMap::new();
            let mut gp_scratch = GP_SCRATCH.iter();
            let mut xmm_scratch = XMM_SCRATCH.iter();
            let mut overflow = false;

            let mut note_spill = |r: &MReg,
                                  spill_map: &mut HashMap<u32, (MReg, SlotId)>,
                                  overflow: &mut bool| {
                if !r.is_virtual() || spill_map.contains_key(&r.id) {
                    return;
                }
                if let Some(Assignment::Spill(slot)) = assignment.get(&r.id) {
                    let scratch = match r.class {
                        RegClass::Gp => gp_scratch.next(),
                        RegClass::Xmm => xmm_scratch.next(),
                    };
                    match scratch {
                        Some(&id) => {
                            let reg = MReg {
                                id: u32::from(id),
                                class: r.class,
                                size: r.size,
                            };
                            spill_map.insert(r.id, (reg, *slot));
                        }
                        None => *overflow = true,
                    }
                }
            };
            inst.visit_uses(&mut |r| note_spill(r, &mut spill_map, &mut overflow));
            inst.visit_defs(&mut |r| note_spill(r, &mut spill_map, &mut overflow));
            if overflow {
                return Err(Error::Internal(
                    "too many spilled operands in one instruction".into(),
                ));
            }

            // Reload spilled uses, in vreg order so emission is
            // deterministic.
            let mut used: HashSet<u32> = HashSet::new();
            inst.visit_uses(&mut |r| {
                used.insert(r.id);
            });
            let mut spills: Vec<(u32, MReg, SlotId)> = spill_map
                .iter()
                .map(|(v, (s, sl))| (*v, *s, *sl))
                .collect();
            spills.sort_by_key(|&(v, _, _)| v);
            for &(vreg, scratch, slot) in &spills {
                if used.contains(&vreg) {
                    out.push(load_spill(scratch, slot));
                }
            }

            let full_map = |r: &MReg| -> MReg {
                if let Some((scratch, _)) = spill_map.get(&r.id) {
                    return scratch.with_size(r.size);
                }
                match map_reg(r) {
                    Ok(m) => m,
                    Err(_) => unreachable!("spill handled above"),
                }
            };
            let mut rewritten = inst.clone();
            rewrite_inst(&mut rewritten, &full_map);
            out.push(rewritten);

            // Write back spilled defs.
            let mut defs: HashSet<u32> = HashSet::new();
            inst.visit_defs(&mut |r| {
                defs.insert(r.id);
            });
            for &(vreg, scratch, slot) in &spills {
                if defs.contains(&vreg) {
                    out.push(store_spill(scratch, slot));
                }
            }
        }
        blk.insts = out;
    }
    Ok(())
}

fn load_spill(scratch: MReg, slot: SlotId) -> MInst {
    if scratch.class == RegClass::Xmm {
        MInst::MovS {
            double: true,
            dst: MOperand::reg(scratch),
            src: MOperand::Slot {
                id: slot,
                offset: 0,
                size: OpSize::B64,
            },
        }
    } else {
        MInst::Mov {
            dst: MOperand::reg(scratch.with_size(OpSize::B64)),
            src: MOperand::Slot {
                id: slot,
                offset: 0,
                size: OpSize::B64,
            },
        }
    }
}

fn store_spill(scratch: MReg, slot: SlotId) -> MInst {
    if scratch.class == RegClass::Xmm {
        MInst::MovS {
            double: true,
            dst: MOperand::Slot {
                id: slot,
                offset: 0,
                size: OpSize::B64,
            },
            src: MOperand::reg(scratch),
        }
    } else {
        MInst::Mov {
            dst: MOperand::Slot {
                id: slot,
                offset: 0,
                size: OpSize::B64,
            },
            src: MOperand::reg(scratch.with_size(OpSize::B64)),
        }
    }
}

/// Apply a register mapping to every register field of an instruction.
fn rewrite_inst(inst: &mut MInst, map: &impl Fn(&MReg) -> MReg) {
    let map_mem = |m: &mut crate::mir::MMem| {
        if let Some(b) = &mut m.base {
            *b = map(b);
        }
        if let Some((i, _)) = &mut m.index {
            *i = map(i);
        }
    };
    let map_op = |op: &mut MOperand| match op {
        MOperand::Reg(r) => *r = map(r),
        MOperand::Mem { mem, .. } => map_mem(mem),
        _ => {}
    };
    match inst {
        MInst::Mov { dst, src } | MInst::MovS { dst, src, .. } => {
            map_op(dst);
            map_op(src);
        }
        MInst::MovSX { dst, src } | MInst::MovZX { dst, src } => {
            *dst = map(dst);
            *src = map(src);
        }
        MInst::Alu { dst, src, .. } => {
            map_op(dst);
            map_op(src);
        }
        MInst::IMul { dst, src } => {
            *dst = map(dst);
            map_op(src);
        }
        MInst::Div { divisor, .. } => map_op(divisor),
        MInst::Neg { op } | MInst::Not { op } => map_op(op),
        MInst::Shift { dst, count, .. } => {
            map_op(dst);
            map_op(count);
        }
        MInst::Lea { dst, mem } => {
            *dst = map(dst);
            map_mem(mem);
        }
        MInst::LeaSlot { dst, .. } | MInst::LeaSym { dst, .. } | MInst::Setcc { dst, .. } => {
            *dst = map(dst);
        }
        MInst::CallReg { target, .. } => *target = map(target),
        MInst::AluS { dst, src, .. } => {
            *dst = map(dst);
            map_op(src);
        }
        MInst::UComiS { a, b, .. } => {
            *a = map(a);
            map_op(b);
        }
        MInst::Cvtsi2S { dst, src, .. }
        | MInst::Cvtts2Si { dst, src, .. }
        | MInst::MovdToXmm { dst, src }
        | MInst::MovdFromXmm { dst, src } => {
            *dst = map(dst);
            *src = map(src);
        }
        MInst::Cvts2S { dst, src, .. } => {
            *dst = map(dst);
            map_op(src);
        }
        MInst::Xorps { dst, src } => {
            *dst = map(dst);
            *src = map(src);
        }
        MInst::SignExtendAx { .. }
        | MInst::CallSym { .. }
        | MInst::CallRip { .. }
        | MInst::Ret
        | MInst::Trap
        | MInst::Jcc { .. }
        | MInst::Jmp { .. } => {}
    }
}
