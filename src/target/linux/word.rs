//! Word-at-a-time memory access through ptrace.
//!
//! The tracee must be attached and stopped. Each word costs one system call, but the kernel
//! lets a tracer read and write pages regardless of their protection.
//!
//! Words are big-endian views of memory: the most significant byte of a word returned by
//! [`peek`] is the byte stored at the lowest address. Byte buffers pass through unchanged.

use super::{memory::PAGE_SIZE, Request};
use crate::MemResult;
use nix::{sys::ptrace, unistd::Pid};
use std::mem;

/// A machine word as transferred by a single peek or poke.
pub type Word = u64;

/// Size of a word in bytes.
pub const WORD_SIZE: usize = mem::size_of::<libc::c_long>();

fn peek_raw(pid: Pid, addr: usize) -> MemResult<[u8; WORD_SIZE]> {
    let data = ptrace::read(pid, addr as ptrace::AddressType)
        .map_err(Request::PeekData.fail(pid, addr))?;
    Ok(data.to_ne_bytes())
}

fn poke_raw(pid: Pid, addr: usize, bytes: [u8; WORD_SIZE]) -> MemResult<()> {
    ptrace::write(
        pid,
        addr as ptrace::AddressType,
        libc::c_long::from_ne_bytes(bytes),
    )
    .map_err(Request::PokeData.fail(pid, addr))
}

/// Reads one word at `addr`.
pub fn peek(pid: Pid, addr: usize) -> MemResult<Word> {
    Ok(Word::from_be_bytes(peek_raw(pid, addr)?))
}

/// Reads one word at `addr` in native byte order, i.e. byte-swapped relative to [`peek`].
pub fn peek_swapped(pid: Pid, addr: usize) -> MemResult<Word> {
    Ok(peek(pid, addr)?.swap_bytes())
}

/// Writes one word at `addr`. The most significant byte lands at `addr`.
pub fn poke(pid: Pid, addr: usize, word: Word) -> MemResult<()> {
    poke_raw(pid, addr, word.to_be_bytes())
}

/// Packs up to `WORD_SIZE` bytes of `bytes` starting at `offset` into a word, big-endian.
/// Missing trailing bytes are zero.
pub fn pack_word(bytes: &[u8], offset: usize) -> Word {
    let mut result: Word = 0;
    for i in 0..WORD_SIZE {
        result <<= 8;
        if let Some(b) = bytes.get(offset + i) {
            result |= *b as Word;
        }
    }
    result
}

/// Picks the word used to access `len < WORD_SIZE` bytes at `addr`. Returns the word's address
/// and the offset of `addr` inside it.
///
/// The word starts at `addr` unless that would run into the next page, which may be unmapped.
/// Then it ends at `addr + len` instead.
fn short_window(addr: usize, len: usize) -> (usize, usize) {
    let page = *PAGE_SIZE;
    if addr % page + WORD_SIZE <= page {
        (addr, 0)
    } else {
        let shift = WORD_SIZE - len;
        (addr - shift, shift)
    }
}

/// Reads `len` bytes starting at `addr`.
pub fn read(pid: Pid, addr: usize, len: usize) -> MemResult<Vec<u8>> {
    let mut buf = vec![0; len];
    read_into(pid, addr, &mut buf)?;
    Ok(buf)
}

/// Fills `buf` with memory starting at `addr`.
///
/// When `buf` spans at least one word, no byte past `addr + buf.len()` is touched: the last
/// partial word is read from a window that overlaps the previous one. Shorter reads never
/// touch the page after the range.
pub fn read_into(pid: Pid, addr: usize, buf: &mut [u8]) -> MemResult<()> {
    let len = buf.len();
    let full = len - len % WORD_SIZE;

    let mut offset = 0;
    while offset < full {
        let word = peek_raw(pid, addr + offset)?;
        buf[offset..offset + WORD_SIZE].copy_from_slice(&word);
        offset += WORD_SIZE;
    }

    if full == len {
        return Ok(());
    }

    if len >= WORD_SIZE {
        let word = peek_raw(pid, addr + len - WORD_SIZE)?;
        buf[full..].copy_from_slice(&word[WORD_SIZE - (len - full)..]);
    } else {
        let (start, shift) = short_window(addr, len);
        let word = peek_raw(pid, start)?;
        buf.copy_from_slice(&word[shift..shift + len]);
    }
    Ok(())
}

/// Writes `data` starting at `addr`.
///
/// A failure leaves every word before the failing one written; nothing is rolled back.
pub fn write(pid: Pid, addr: usize, data: &[u8]) -> MemResult<()> {
    let len = data.len();
    let full = len - len % WORD_SIZE;

    let mut offset = 0;
    while offset < full {
        poke(pid, addr + offset, pack_word(data, offset))?;
        offset += WORD_SIZE;
    }

    if full == len {
        return Ok(());
    }

    if len >= WORD_SIZE {
        // Last window overlaps bytes that were just written with the same values.
        let start = len - WORD_SIZE;
        poke(pid, addr + start, pack_word(data, start))
    } else {
        // Preserve the bytes around the range.
        let (start, shift) = short_window(addr, len);
        let mut word = peek_raw(pid, start)?;
        word[shift..shift + len].copy_from_slice(data);
        poke_raw(pid, start, word)
    }
}
