use alloc::vec::Vec;
use x86_64::structures::paging::PageTableFlags;

use super::{ExecError, AT_EXECFN, AT_NULL, AT_PAGESZ};
use crate::config::MAX_ARGS;
use crate::memory::{align_down, AddressSpace, PAGE_SIZE};

/// Lowest address of the initial user stack.
pub const STACK_BASE: u64 = 0x0000_0000_0100_0000;
pub const STACK_SIZE: u64 = 0x0000_0000_0001_0000;
/// Scratch area holding the argv/envp strings.
pub const ARG_AREA: u64 = 0x0000_0000_00F0_0000;
pub const ARG_AREA_SIZE: u64 = STACK_SIZE;

/// Copy NUL-terminated strings downward from `*cursor`, returning their
/// user addresses. Stops quietly when the area or the count cap runs out.
fn push_strings(space: &AddressSpace, cursor: &mut u64, strings: &[&[u8]]) -> Result<Vec<u64>, ExecError> {
    let mut addrs = Vec::new();
    for s in strings.iter().take(MAX_ARGS) {
        let need = s.len() as u64 + 1;
        if *cursor < ARG_AREA + need {
            crate::log_warn!("stack: argument area exhausted after {} strings", addrs.len());
            break;
        }
        *cursor -= need;
        space.write_bytes(*cursor, s).map_err(|_| ExecError::MemoryError)?;
        space.write_bytes(*cursor + s.len() as u64, &[0]).map_err(|_| ExecError::MemoryError)?;
        addrs.push(*cursor);
    }
    Ok(addrs)
}

/// Push one word, refusing to leave the stack region.
fn push(space: &AddressSpace, rsp: &mut u64, value: u64) -> Result<(), ExecError> {
    if *rsp < STACK_BASE + 8 {
        return Err(ExecError::StackAbi);
    }
    *rsp -= 8;
    space.write_u64(*rsp, value).map_err(|_| ExecError::StackAbi)
}

/// Map the stack and argument area and lay out the entry stack:
///
/// ```text
/// rsp ->  argc
///         argv[0..argc]   NULL
///         envp[0..envc]   NULL
///         AT_PAGESZ 4096  AT_EXECFN argv[0]  AT_NULL 0
/// ```
///
/// The returned stack pointer is always 8 mod 16.
pub fn setup_stack(space: &mut AddressSpace, argv: &[&[u8]], envp: &[&[u8]], nx: bool) -> Result<u64, ExecError> {
    let mut flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::USER_ACCESSIBLE;
    if nx {
        flags |= PageTableFlags::NO_EXECUTE;
    }
    space
        .map_range_zeroed(STACK_BASE, STACK_SIZE, flags)
        .map_err(|_| ExecError::MemoryError)?;
    space
        .map_range_zeroed(ARG_AREA, ARG_AREA_SIZE, flags)
        .map_err(|_| ExecError::MemoryError)?;

    let mut cursor = ARG_AREA + ARG_AREA_SIZE;
    let arg_ptrs = push_strings(space, &mut cursor, argv)?;
    let env_ptrs = push_strings(space, &mut cursor, envp)?;

    let mut words = Vec::with_capacity(arg_ptrs.len() + env_ptrs.len() + 9);
    words.push(arg_ptrs.len() as u64);
    words.extend_from_slice(&arg_ptrs);
    words.push(0);
    words.extend_from_slice(&env_ptrs);
    words.push(0);
    words.extend_from_slice(&[AT_PAGESZ, PAGE_SIZE]);
    words.extend_from_slice(&[AT_EXECFN, arg_ptrs.first().copied().unwrap_or(0)]);
    words.extend_from_slice(&[AT_NULL, 0]);

    let mut rsp = align_down(STACK_BASE + STACK_SIZE, 16);
    if words.len() % 2 == 0 {
        push(space, &mut rsp, 0)?;
    }
    for &word in words.iter().rev() {
        push(space, &mut rsp, word)?;
    }

    if rsp % 16 != 8 {
        crate::log_error!("stack: rsp={:#x} breaks entry alignment", rsp);
        return Err(ExecError::StackAbi);
    }
    crate::log_debug!(
        "stack: argc={} envc={} words={} rsp={:#x}",
        arg_ptrs.len(),
        env_ptrs.len(),
        words.len(),
        rsp
    );
    Ok(rsp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Arena;

    fn read_words(space: &AddressSpace, rsp: u64, n: usize) -> Vec<u64> {
        (0..n).map(|i| space.read_u64(rsp + 8 * i as u64).unwrap()).collect()
    }

    #[test]
    fn entry_stack_decodes_argv_envp_and_auxv() {
        let arena = Arena::new(128);
        let mut space = AddressSpace::new(arena.memory(), None).unwrap();
        let argv: [&[u8]; 3] = [b"prog", b"a", b"b"];
        let envp: [&[u8]; 1] = [b"X=1"];
        let rsp = setup_stack(&mut space, &argv, &envp, true).unwrap();

        assert_eq!(rsp % 16, 8);
        let w = read_words(&space, rsp, 12);
        assert_eq!(w[0], 3);
        assert!(w[1..4].iter().all(|&p| p != 0));
        assert_eq!(w[4], 0);
        assert_ne!(w[5], 0);
        assert_eq!(w[6], 0);
        assert_eq!(&w[7..9], &[AT_PAGESZ, PAGE_SIZE]);
        assert_eq!(&w[9..11], &[AT_EXECFN, w[1]]);
        assert_eq!(w[11], AT_NULL);
        assert_eq!(space.read_u64(rsp + 12 * 8).unwrap(), 0);

        assert_eq!(space.read_cstr(w[1], 64).unwrap(), b"prog");
        assert_eq!(space.read_cstr(w[3], 64).unwrap(), b"b");
        assert_eq!(space.read_cstr(w[5], 64).unwrap(), b"X=1");
    }

    #[test]
    fn alignment_holds_for_both_parities() {
        let arena = Arena::new(128);
        let mut space = AddressSpace::new(arena.memory(), None).unwrap();
        let one: [&[u8]; 1] = [b"x"];
        let two: [&[u8]; 2] = [b"x", b"y"];
        assert_eq!(setup_stack(&mut space, &one, &[], true).unwrap() % 16, 8);
        assert_eq!(setup_stack(&mut space, &two, &[], true).unwrap() % 16, 8);
    }

    #[test]
    fn envp_strings_do_not_overwrite_argv_strings() {
        let arena = Arena::new(128);
        let mut space = AddressSpace::new(arena.memory(), None).unwrap();
        let argv: [&[u8]; 2] = [b"first", b"second"];
        let envp: [&[u8]; 2] = [b"HOME=/", b"PATH=/bin"];
        let rsp = setup_stack(&mut space, &argv, &envp, false).unwrap();
        let w = read_words(&space, rsp, 7);
        assert_eq!(space.read_cstr(w[1], 64).unwrap(), b"first");
        assert_eq!(space.read_cstr(w[2], 64).unwrap(), b"second");
        assert_eq!(space.read_cstr(w[4], 64).unwrap(), b"HOME=/");
        assert_eq!(space.read_cstr(w[5], 64).unwrap(), b"PATH=/bin");
    }

    #[test]
    fn argv_is_capped() {
        let arena = Arena::new(128);
        let mut space = AddressSpace::new(arena.memory(), None).unwrap();
        let many: Vec<&[u8]> = (0..MAX_ARGS + 10).map(|_| &b"arg"[..]).collect();
        let rsp = setup_stack(&mut space, &many, &[], true).unwrap();
        assert_eq!(space.read_u64(rsp).unwrap(), MAX_ARGS as u64);
    }

    #[test]
    fn empty_argv_reports_no_execfn() {
        let arena = Arena::new(128);
        let mut space = AddressSpace::new(arena.memory(), None).unwrap();
        let rsp = setup_stack(&mut space, &[], &[], true).unwrap();
        let w = read_words(&space, rsp, 9);
        assert_eq!(w[0], 0);
        assert_eq!(&w[5..7], &[AT_EXECFN, 0]);
        assert_eq!(space.leaf_flags(STACK_BASE).map(|f| f.contains(PageTableFlags::NO_EXECUTE)), Some(true));
    }
}
