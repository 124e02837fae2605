//! Value witness tables for builtin POD types, usable by in-process metadata.
use crate::{
    abi::{ValueWitnessFlags, ValueWitnessTable},
    symbols::SymbolTable,
    utils::Address,
};
use std::{mem::size_of, ptr};

unsafe extern "C" fn initialize_buffer_with_copy_of_buffer<const N: usize>(
    dest: *mut u8,
    src: *mut u8,
    _ty: *const u8,
) -> *mut u8 {
    ptr::copy_nonoverlapping(src, dest, N);
    dest
}

unsafe extern "C" fn destroy(_value: *mut u8, _ty: *const u8) {}

unsafe extern "C" fn copy<const N: usize>(dest: *mut u8, src: *mut u8, _ty: *const u8) -> *mut u8 {
    ptr::copy_nonoverlapping(src, dest, N);
    dest
}

/// Number of extra tag bytes a single-payload enum over an `N`-byte POD payload without
/// extra inhabitants needs for `empty_cases` cases.
fn extra_tag_bytes(payload_size: usize, empty_cases: u32) -> usize {
    if empty_cases == 0 {
        return 0;
    }
    let tags = if payload_size >= 4 {
        2
    } else {
        let bits = payload_size * 8;
        let per_tag = 1u64 << bits;
        1 + (empty_cases as u64).div_ceil(per_tag)
    };
    match tags {
        0..=1 => 0,
        2..=255 => 1,
        256..=65535 => 2,
        _ => 4,
    }
}

unsafe fn read_le(at: *const u8, len: usize) -> u32 {
    let mut buf = [0u8; 4];
    ptr::copy_nonoverlapping(at, buf.as_mut_ptr(), len.min(4));
    u32::from_le_bytes(buf)
}

unsafe fn write_le(at: *mut u8, len: usize, value: u32) {
    let buf = value.to_le_bytes();
    ptr::copy_nonoverlapping(buf.as_ptr(), at, len.min(4));
}

unsafe extern "C" fn get_enum_tag_single_payload<const N: usize>(
    value: *const u8,
    empty_cases: u32,
    _ty: *const u8,
) -> u32 {
    let tag_bytes = extra_tag_bytes(N, empty_cases);
    if tag_bytes == 0 {
        return 0;
    }
    let tag = read_le(value.add(N), tag_bytes);
    if tag == 0 {
        return 0;
    }
    let case_index = if N >= 4 {
        read_le(value, N)
    } else {
        ((tag - 1) << (N * 8)) | read_le(value, N)
    };
    case_index + 1
}

unsafe extern "C" fn store_enum_tag_single_payload<const N: usize>(
    value: *mut u8,
    which: u32,
    empty_cases: u32,
    _ty: *const u8,
) {
    let tag_bytes = extra_tag_bytes(N, empty_cases);
    if which == 0 {
        if tag_bytes > 0 {
            write_le(value.add(N), tag_bytes, 0);
        }
        return;
    }
    let case_index = which - 1;
    let (tag, payload) = if N >= 4 {
        (1, case_index)
    } else {
        let bits = N * 8;
        ((case_index >> bits) + 1, case_index & ((1u32 << bits) - 1))
    };
    ptr::write_bytes(value, 0, N);
    write_le(value, N, payload);
    write_le(value.add(N), tag_bytes, tag);
}

const fn pod_table<const N: usize>(alignment: usize) -> ValueWitnessTable {
    let inline = N <= 3 * size_of::<usize>();
    let mut flags = (alignment - 1) as u32;
    if !inline {
        flags |= ValueWitnessFlags::IS_NON_INLINE;
    }
    ValueWitnessTable {
        initialize_buffer_with_copy_of_buffer: initialize_buffer_with_copy_of_buffer::<N>,
        destroy,
        initialize_with_copy: copy::<N>,
        assign_with_copy: copy::<N>,
        initialize_with_take: copy::<N>,
        assign_with_take: copy::<N>,
        get_enum_tag_single_payload: get_enum_tag_single_payload::<N>,
        store_enum_tag_single_payload: store_enum_tag_single_payload::<N>,
        size: N,
        stride: if N == 0 { 1 } else { N },
        flags,
        extra_inhabitant_count: 0,
    }
}

pub static BI8_WV: ValueWitnessTable = pod_table::<1>(1);
pub static BI16_WV: ValueWitnessTable = pod_table::<2>(2);
pub static BI32_WV: ValueWitnessTable = pod_table::<4>(4);
pub static BI64_WV: ValueWitnessTable = pod_table::<8>(8);
pub static BI128_WV: ValueWitnessTable = pod_table::<16>(16);
pub static EMPTY_TUPLE_WV: ValueWitnessTable = pod_table::<0>(1);

/// Exported names of the builtin tables.
pub static BUILTINS: [(&str, &ValueWitnessTable); 6] = [
    ("$sBi8_WV", &BI8_WV),
    ("$sBi16_WV", &BI16_WV),
    ("$sBi32_WV", &BI32_WV),
    ("$sBi64_WV", &BI64_WV),
    ("$sBi128_WV", &BI128_WV),
    ("$sytWV", &EMPTY_TUPLE_WV),
];

/// Symbol of the builtin integer table for a POD layout of `size` bytes, if there is one.
pub fn builtin_integer_symbol(size: usize) -> Option<String> {
    matches!(size, 1 | 2 | 4 | 8 | 16).then(|| format!("$sBi{}_WV", size * 8))
}

pub fn register_builtins(symbols: &SymbolTable) {
    for (name, table) in BUILTINS.iter() {
        symbols.register(*name, Address::from_ptr(*table as *const ValueWitnessTable));
    }
}
