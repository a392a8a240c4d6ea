/*
    alloctrace  -  a heap allocation tracer
    Copyright (C) 2023  Matt Kimball

    This program is free software: you can redistribute it and/or modify it
    under the terms of the GNU General Public License as published by the
    Free Software Foundation, either version 3 of the License, or (at your
    option) any later version.

    This program is distributed in the hope that it will be useful, but
    WITHOUT ANY WARRANTY; without even the implied warranty of MERCHANTABILITY
    or FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License
    for more details.

    You should have received a copy of the GNU General Public License along
    with this program. If not, see <https://www.gnu.org/licenses/>.
*/

use object::{Object, ObjectSection, ObjectSegment};
use std::error::Error;

// The outcome of a fingerprint scan for one allocator entry point.
// An offset of zero means no match.
#[derive(Debug)]
pub struct FunctionSignature {
    pub name: &'static str,
    pub offset: u64,
}

// A prologue fingerprint.  Mask bytes of zero are wildcards covering
// link-time displacements and thread-pointer offsets.
struct FunctionPattern {
    name: &'static str,
    bytes: &'static [u8],
    mask: &'static [u8],
}

// Entry-point fingerprints as gcc -O2 lays out the glibc 2.31 - 2.35
// static allocator.  Statically linked binaries keep these even when
// fully stripped, which is the only case this scan is consulted for.
const PATTERNS: [FunctionPattern; 5] = [
    FunctionPattern {
        // push r14; push r13; push r12; push rbp; push rbx; sub rsp, ...;
        // mov rax, fs:<tcache>
        name: "malloc",
        bytes: &[
            0x41, 0x56, 0x41, 0x55, 0x41, 0x54, 0x55, 0x53, 0x48, 0x83, 0xEC, 0x10, 0x64, 0x48,
            0x8B, 0x04, 0x25, 0x00, 0x00, 0x00, 0x00,
        ],
        mask: &[
            0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
            0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00,
        ],
    },
    FunctionPattern {
        // test rdi, rdi; jz <ret>; push r12; push rbp; push rbx;
        // mov rbx, rdi; lea rdi, [rbx-0x10]
        name: "free",
        bytes: &[
            0x48, 0x85, 0xFF, 0x0F, 0x84, 0x00, 0x00, 0x00, 0x00, 0x41, 0x54, 0x55, 0x53, 0x48,
            0x89, 0xFB, 0x48, 0x8D, 0x7B, 0xF0,
        ],
        mask: &[
            0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
            0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
        ],
    },
    FunctionPattern {
        // push r15; push r14; push r13; mov r13, rsi; push r12;
        // mov r12, rdi; imul r12, r13
        name: "calloc",
        bytes: &[
            0x41, 0x57, 0x41, 0x56, 0x41, 0x55, 0x49, 0x89, 0xF5, 0x41, 0x54, 0x49, 0x89, 0xFC,
            0x4D, 0x0F, 0xAF, 0xE5,
        ],
        mask: &[
            0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
            0xFF, 0xFF, 0xFF, 0xFF,
        ],
    },
    FunctionPattern {
        // test rdi, rdi; jz <malloc path>; push r13; push r12;
        // mov r12, rsi; push rbp; mov rbp, rdi
        name: "realloc",
        bytes: &[
            0x48, 0x85, 0xFF, 0x74, 0x00, 0x41, 0x55, 0x41, 0x54, 0x49, 0x89, 0xF4, 0x55, 0x48,
            0x89, 0xFD, 0x53,
        ],
        mask: &[
            0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
            0xFF, 0xFF, 0xFF,
        ],
    },
    FunctionPattern {
        // mov rax, rdx; mul rsi; jo <enomem>; mov rsi, rax;
        // jmp <realloc>
        name: "reallocarray",
        bytes: &[
            0x48, 0x89, 0xD0, 0x48, 0xF7, 0xE6, 0x70, 0x00, 0x48, 0x89, 0xC6, 0xE9, 0x00, 0x00,
            0x00, 0x00,
        ],
        mask: &[
            0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00,
            0x00, 0x00,
        ],
    },
];

// Scan the target's .text section for the allocator fingerprints.
// Always produces one FunctionSignature per known allocator; anything
// that did not match carries offset zero.
pub fn find_function_signatures(
    target_path: &str,
) -> Result<Vec<FunctionSignature>, Box<dyn Error>> {
    let data = std::fs::read(target_path)?;
    let elf = object::File::parse(&*data)?;

    let bias = elf
        .segments()
        .map(|segment| segment.address())
        .min()
        .unwrap_or(0);

    let text = match elf.section_by_name(".text") {
        Some(section) => section,
        None => return Ok(no_matches()),
    };
    let text_data = match text.data() {
        Ok(data) => data,
        Err(_) => return Ok(no_matches()),
    };
    let text_base = text.address();

    Ok(PATTERNS
        .iter()
        .map(|pattern| FunctionSignature {
            name: pattern.name,
            offset: match scan(text_data, pattern) {
                Some(position) => text_base - bias + position as u64,
                None => 0,
            },
        })
        .collect())
}

fn no_matches() -> Vec<FunctionSignature> {
    PATTERNS
        .iter()
        .map(|pattern| FunctionSignature {
            name: pattern.name,
            offset: 0,
        })
        .collect()
}

// Find the first position where a masked pattern matches.
fn scan(data: &[u8], pattern: &FunctionPattern) -> Option<usize> {
    let length = pattern.bytes.len();
    if length == 0 || data.len() < length {
        return None;
    }

    'candidate: for start in 0..=data.len() - length {
        for index in 0..length {
            if pattern.mask[index] != 0 && data[start + index] != pattern.bytes[index] {
                continue 'candidate;
            }
        }
        return Some(start);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_bytes_are_wildcards() {
        let pattern = FunctionPattern {
            name: "probe",
            bytes: &[0x48, 0x85, 0xFF, 0x74, 0x00],
            mask: &[0xFF, 0xFF, 0xFF, 0xFF, 0x00],
        };

        let data = [0x90, 0x90, 0x48, 0x85, 0xFF, 0x74, 0x2A, 0xC3];
        assert_eq!(scan(&data, &pattern), Some(2));
    }

    #[test]
    fn unmasked_bytes_must_match() {
        let pattern = FunctionPattern {
            name: "probe",
            bytes: &[0x48, 0x85, 0xFF],
            mask: &[0xFF, 0xFF, 0xFF],
        };

        assert_eq!(scan(&[0x48, 0x85, 0xF6], &pattern), None);
        assert_eq!(scan(&[0x48], &pattern), None);
        assert_eq!(scan(&[], &pattern), None);
    }

    #[test]
    fn finds_the_first_of_several_matches() {
        let pattern = FunctionPattern {
            name: "probe",
            bytes: &[0xC3, 0x00],
            mask: &[0xFF, 0x00],
        };

        let data = [0x01, 0xC3, 0x02, 0xC3, 0x03];
        assert_eq!(scan(&data, &pattern), Some(1));
    }

    #[test]
    fn every_allocator_has_a_pattern() {
        let names: Vec<&str> = PATTERNS.iter().map(|pattern| pattern.name).collect();
        assert_eq!(
            names,
            vec!["malloc", "free", "calloc", "realloc", "reallocarray"]
        );
        for pattern in &PATTERNS {
            assert_eq!(pattern.bytes.len(), pattern.mask.len());
        }
    }
}
