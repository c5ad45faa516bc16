//! Code blocks: straight-line runs of executables ending at the first branch.

use std::fmt;

use pcx_x86::{ByteSource, CodeSize, DecodeError, SegReg};
use thiserror::Error;
use tracing::trace;

use crate::addr::Access;
use crate::exception::Exception;
use crate::interp::{Branch, Executable};
use crate::mem::{CpuBus, PageStamp, PAGE_SHIFT};
use crate::state::{CpuMode, CpuState};

/// Identity of a block in the cache.
///
/// Keyed by linear address so a block is shared between aliases like `0000:7C00` and
/// `07C0:0000`; the executables themselves are position independent. A cached block is only
/// reused by an alias it [fits](CodeBlock::fits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockKey {
    pub start: u32,
    pub mode: CpuMode,
    pub code_size: CodeSize,
}

impl BlockKey {
    /// Key for the block starting at the processor's current `cs:eip`.
    pub fn for_state(cpu: &CpuState) -> Self {
        Self {
            start: cpu.linear_ip(),
            mode: cpu.mode(),
            code_size: cpu.code_size(),
        }
    }
}

/// Which tier produced a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTier {
    /// Straight from the assembler.
    Interpreted,
    /// Rebuilt by a block optimizer.
    Optimized,
}

/// A runnable block of guest code.
///
/// Implementations must be shareable with the background compiler threads.
pub trait CodeBlock: Send + Sync + fmt::Debug {
    fn key(&self) -> BlockKey;

    fn executables(&self) -> &[Executable];

    /// Encoded length of the whole block in bytes.
    fn x86_length(&self) -> u32;

    fn x86_count(&self) -> usize {
        self.executables().len()
    }

    /// Page versions the block was decoded from.
    fn pages(&self) -> &[PageStamp];

    fn tier(&self) -> BlockTier {
        BlockTier::Interpreted
    }

    /// Run the block. `cpu.eip` must hold the block's starting offset.
    fn execute(&self, cpu: &mut CpuState, bus: &mut dyn CpuBus) -> Branch {
        run_executables(self.executables(), self.x86_length(), cpu, bus)
    }

    /// Whether the block's bytes lie inside the current code segment without the instruction
    /// pointer wrapping.
    ///
    /// The assembler never continues a block across an IP wrap, so a block that fits covers one
    /// contiguous linear range and decodes the same under every alias of its key.
    fn fits(&self, cpu: &CpuState) -> bool {
        let end = u64::from(cpu.eip) + u64::from(self.x86_length());
        let limit = cpu.seg(SegReg::Cs).cache.limit.min(cpu.code_size().ip_mask());
        end <= u64::from(limit) + 1
    }

    /// Whether the code under the block is unchanged since it was decoded.
    fn is_still_valid(&self, bus: &dyn CpuBus) -> bool {
        match bus.code_versions() {
            Some(versions) => self.pages().iter().all(|stamp| versions.is_current(stamp)),
            None => true,
        }
    }
}

/// Run `executables` in order, stopping at the first that leaves the block. If all of them fall
/// through, `eip` advances past the block.
pub fn run_executables(
    executables: &[Executable],
    length: u32,
    cpu: &mut CpuState,
    bus: &mut dyn CpuBus,
) -> Branch {
    for exe in executables {
        let branch = exe.execute(cpu, bus);
        if branch.ends_block() {
            return branch;
        }
    }
    cpu.eip = cpu.eip.wrapping_add(length) & cpu.code_size().ip_mask();
    Branch::None
}

/// A block executed instruction by instruction through the interpreter.
#[derive(Debug, Clone)]
pub struct InterpretedBlock {
    key: BlockKey,
    executables: Vec<Executable>,
    length: u32,
    pages: Vec<PageStamp>,
}

impl InterpretedBlock {
    pub fn from_parts(
        key: BlockKey,
        executables: Vec<Executable>,
        length: u32,
        pages: Vec<PageStamp>,
    ) -> Self {
        Self {
            key,
            executables,
            length,
            pages,
        }
    }

    /// A copy of `block` with the same executables.
    pub fn copy_of(block: &dyn CodeBlock) -> Self {
        Self::from_parts(
            block.key(),
            block.executables().to_vec(),
            block.x86_length(),
            block.pages().to_vec(),
        )
    }
}

impl CodeBlock for InterpretedBlock {
    fn key(&self) -> BlockKey {
        self.key
    }

    fn executables(&self) -> &[Executable] {
        &self.executables
    }

    fn x86_length(&self) -> u32 {
        self.length
    }

    fn pages(&self) -> &[PageStamp] {
        &self.pages
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssembleError {
    /// Fetching the first instruction faulted (limit violation, unmapped memory, over-long
    /// encoding).
    #[error("instruction fetch fault: {0}")]
    Fault(Exception),
    /// The first instruction has no implementation.
    #[error(transparent)]
    Decode(DecodeError),
}

/// Instruction fetch through CS, with the same checks as data accesses.
struct CodeCursor<'a> {
    cpu: &'a CpuState,
    bus: &'a mut dyn CpuBus,
    eip: u32,
    ip_mask: u32,
    fault: Option<Exception>,
}

impl CodeCursor<'_> {
    fn fetch(&mut self, eip: u32) -> Result<u8, Exception> {
        let linear = self.cpu.translate(SegReg::Cs, eip, 1, Access::Execute)?;
        self.bus.read_u8(linear)
    }
}

impl ByteSource for CodeCursor<'_> {
    fn next_u8(&mut self) -> Result<u8, DecodeError> {
        match self.fetch(self.eip) {
            Ok(b) => {
                self.eip = self.eip.wrapping_add(1) & self.ip_mask;
                Ok(b)
            }
            Err(e) => {
                self.fault = Some(e);
                Err(DecodeError::UnexpectedEof)
            }
        }
    }

    fn lookahead(&mut self, buf: &mut [u8]) -> usize {
        let mut eip = self.eip;
        for (i, slot) in buf.iter_mut().enumerate() {
            match self.fetch(eip) {
                Ok(b) => *slot = b,
                Err(_) => return i,
            }
            eip = eip.wrapping_add(1) & self.ip_mask;
        }
        buf.len()
    }
}

/// Builds blocks by decoding forward from `cs:eip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAssembler {
    pub max_instructions: usize,
    pub max_bytes: u32,
}

impl Default for BlockAssembler {
    fn default() -> Self {
        Self {
            max_instructions: 256,
            max_bytes: 4096,
        }
    }
}

impl BlockAssembler {
    /// Decode a block at the processor's current position.
    ///
    /// Only a failure on the first instruction is an error. A later fetch fault or unsupported
    /// opcode ends the block just before it, so the problem surfaces (with a precise `eip`)
    /// when execution actually reaches that instruction.
    pub fn assemble(
        &self,
        cpu: &CpuState,
        bus: &mut dyn CpuBus,
    ) -> Result<InterpretedBlock, AssembleError> {
        let key = BlockKey::for_state(cpu);
        let code_size = cpu.code_size();
        let ip_mask = code_size.ip_mask();
        let cs_base = cpu.seg(SegReg::Cs).cache.base;
        let start = cpu.eip;

        let mut executables: Vec<Executable> = Vec::new();
        let mut pages: Vec<PageStamp> = Vec::new();
        let mut offset = 0u32;

        loop {
            let eip = start.wrapping_add(offset) & ip_mask;
            let mut cursor = CodeCursor {
                cpu,
                bus: &mut *bus,
                eip,
                ip_mask,
                fault: None,
            };
            let decoded = Executable::decode(start, eip, offset, code_size, &mut cursor);
            let fault = cursor.fault.take();
            let exe = match decoded {
                Ok(exe) => exe,
                Err(err) if executables.is_empty() => {
                    return Err(match (fault, err) {
                        (Some(fault), _) => AssembleError::Fault(fault),
                        (None, DecodeError::TooLong) => {
                            AssembleError::Fault(Exception::GeneralProtection(0))
                        }
                        (None, err) => AssembleError::Decode(err),
                    });
                }
                Err(err) => {
                    trace!(eip, %err, "block ends before undecodable instruction");
                    break;
                }
            };

            // An instruction reaching past the IP mask wraps back to offset 0; only the first
            // instruction of a block may do that.
            let end = u64::from(start) + u64::from(offset) + u64::from(exe.byte_len());
            if !executables.is_empty() && end > u64::from(ip_mask) + 1 {
                trace!(eip, "block ends at instruction pointer wrap");
                break;
            }

            let first = cs_base.wrapping_add(eip);
            let last = first.wrapping_add(exe.byte_len() - 1);
            for page in [first >> PAGE_SHIFT, last >> PAGE_SHIFT] {
                if !pages.iter().any(|p| p.page == page) {
                    let version = bus
                        .code_versions()
                        .map_or(0, |versions| versions.version(page));
                    pages.push(PageStamp { page, version });
                }
            }

            offset += exe.byte_len();
            let ends = exe.inst().is_branch();
            executables.push(exe);
            if ends || executables.len() >= self.max_instructions || offset >= self.max_bytes {
                break;
            }
        }

        trace!(
            start = key.start,
            instructions = executables.len(),
            bytes = offset,
            "assembled block"
        );
        Ok(InterpretedBlock::from_parts(key, executables, offset, pages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatBus;
    use pcx_x86::Op;

    fn real_mode_at(code: &[u8], cs: u16, ip: u32) -> (CpuState, FlatBus) {
        let mut bus = FlatBus::new(0x20000);
        let mut cpu = CpuState::new();
        *cpu.seg_mut(SegReg::Cs) = crate::state::Segment::real(cs);
        cpu.eip = ip;
        bus.load(cpu.linear_ip(), code);
        (cpu, bus)
    }

    #[test]
    fn block_stops_after_first_branch() {
        // mov ax, 1; add ax, bx; jmp $; nop
        let (cpu, mut bus) =
            real_mode_at(&[0xB8, 0x01, 0x00, 0x01, 0xD8, 0xEB, 0xFE, 0x90], 0, 0x7C00);
        let block = BlockAssembler::default().assemble(&cpu, &mut bus).unwrap();
        assert_eq!(block.x86_count(), 3);
        assert_eq!(block.x86_length(), 7);
        assert!(matches!(block.executables()[2].inst().op, Op::Jmp { .. }));
        assert_eq!(block.executables()[1].offset(), 3);
        assert_eq!(block.key().start, 0x7C00);
    }

    #[test]
    fn instruction_ceiling_splits_long_runs() {
        let (cpu, mut bus) = real_mode_at(&[0x90; 32], 0, 0x100);
        let assembler = BlockAssembler {
            max_instructions: 8,
            max_bytes: 4096,
        };
        let block = assembler.assemble(&cpu, &mut bus).unwrap();
        assert_eq!(block.x86_count(), 8);
    }

    #[test]
    fn unsupported_first_instruction_is_an_error_later_one_ends_the_block() {
        // cpuid
        let (cpu, mut bus) = real_mode_at(&[0x0F, 0xA2], 0, 0x100);
        let err = BlockAssembler::default().assemble(&cpu, &mut bus).unwrap_err();
        assert!(matches!(err, AssembleError::Decode(ref e) if e.is_unimplemented()));

        // nop; cpuid
        let (cpu, mut bus) = real_mode_at(&[0x90, 0x0F, 0xA2], 0, 0x100);
        let block = BlockAssembler::default().assemble(&cpu, &mut bus).unwrap();
        assert_eq!(block.x86_count(), 1);
        assert_eq!(block.x86_length(), 1);
    }

    #[test]
    fn fetch_past_cs_limit_is_a_fault() {
        let mut bus = FlatBus::new(0x1000);
        let mut cpu = CpuState::flat32();
        cpu.seg_mut(SegReg::Cs).cache.limit = 0xFF;
        cpu.eip = 0x100;
        let err = BlockAssembler::default().assemble(&cpu, &mut bus).unwrap_err();
        assert_eq!(err, AssembleError::Fault(Exception::GeneralProtection(0)));
    }

    #[test]
    fn executing_a_block_falls_through_past_its_end() {
        // inc ax; inc ax  (block limited to these two by the ceiling)
        let (mut cpu, mut bus) = real_mode_at(&[0x40, 0x40, 0x40], 0x1000, 0x10);
        let assembler = BlockAssembler {
            max_instructions: 2,
            max_bytes: 4096,
        };
        let block = assembler.assemble(&cpu, &mut bus).unwrap();
        assert_eq!(block.execute(&mut cpu, &mut bus), Branch::None);
        assert_eq!(cpu.eip, 0x12);
        assert_eq!(cpu.gpr[0], 2);
        assert!(block.is_still_valid(&bus));
        bus.write_u8(0x10010, 0x90).unwrap();
        assert!(!block.is_still_valid(&bus));
    }

    #[test]
    fn block_ends_before_an_instruction_that_wraps_ip() {
        // nop at FFFE, then `mov ax, imm16` at FFFF whose immediate wraps to offset 0.
        let (cpu, mut bus) = real_mode_at(&[0x90, 0xB8], 0, 0xFFFE);
        let block = BlockAssembler::default().assemble(&cpu, &mut bus).unwrap();
        assert_eq!(block.x86_count(), 1);
        assert_eq!(block.x86_length(), 1);
        assert!(block.fits(&cpu));
    }

    #[test]
    fn wrapping_first_instruction_does_not_fit() {
        let (mut cpu, mut bus) = real_mode_at(&[0xB8], 0, 0xFFFF);
        bus.load(0, &[0x11, 0x22, 0xF4]);
        let block = BlockAssembler::default().assemble(&cpu, &mut bus).unwrap();
        assert_eq!(block.x86_length(), 3);
        assert!(!block.fits(&cpu));
        block.execute(&mut cpu, &mut bus);
        assert_eq!(cpu.gpr[0], 0x2211);
        assert_eq!(cpu.eip, 2);
    }

    #[test]
    fn smaller_code_limit_does_not_fit() {
        let mut bus = FlatBus::new(0x2000);
        bus.load(0x1000, &[0x90, 0x90, 0xF4]);
        let mut cpu = CpuState::flat32();
        cpu.eip = 0x1000;
        let block = BlockAssembler::default().assemble(&cpu, &mut bus).unwrap();
        assert!(block.fits(&cpu));
        cpu.seg_mut(SegReg::Cs).cache.limit = 0x1001;
        assert!(!block.fits(&cpu));
    }
}
