//! Interfaces related to registers reading & writing.

use std::fmt::Debug;

/// Trait that can be used to read & write the target's registers.
pub trait Registers: Debug {
    /// Returns a current instruction pointer.
    fn ip(&self) -> u64;

    /// Sets an instruction pointer to the provided value.
    fn set_ip(&mut self, ip: u64);

    /// Returns a current stack pointer.
    fn sp(&self) -> u64;

    /// Sets a stack pointer to the provided value.
    fn set_sp(&mut self, sp: u64);

    /// Returns a base pointer.
    /// Returns `None` if the standard ABI on the platform has no base pointer.
    fn bp(&self) -> Option<u64>;

    /// Sets a base pointer to the provided value.
    /// Returns `None` if the standard ABI on the platform has no base pointer.
    #[must_use]
    fn set_bp(&mut self, bp: u64) -> Option<()>;

    /// Looks up a register by its lower-case name.
    /// Returns `None` when a register doesn't exist.
    fn reg_for_name(&self, name: &str) -> Option<u64>;

    /// Sets a register by its lower-case name.
    /// Returns `None` when a register doesn't exist.
    #[must_use]
    fn set_reg_for_name(&mut self, name: &str, val: u64) -> Option<()>;
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use x86_64::RegisterSet;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod x86_64 {
    // This struct is available only on Linux.
    use libc::user_regs_struct;

    macro_rules! register_set {
        ($($name:ident),* $(,)?) => {
            /// General purpose registers of one stopped thread.
            ///
            /// Field order matches the kernel's `struct user_regs_struct`, which is what the
            /// bulk get/set register requests transfer.
            #[repr(C)]
            #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
            pub struct RegisterSet {
                $(pub $name: u64,)*
            }

            impl RegisterSet {
                /// Register names in layout order.
                pub const NAMES: &'static [&'static str] = &[$(stringify!($name)),*];

                /// Returns all registers as words, in layout order.
                pub fn to_words(&self) -> Vec<u64> {
                    vec![$(self.$name),*]
                }

                fn slot(&mut self, name: &str) -> Option<&mut u64> {
                    match name {
                        $(stringify!($name) => Some(&mut self.$name),)*
                        _ => None,
                    }
                }

                fn value(&self, name: &str) -> Option<u64> {
                    match name {
                        $(stringify!($name) => Some(self.$name),)*
                        _ => None,
                    }
                }
            }

            impl From<user_regs_struct> for RegisterSet {
                fn from(regs: user_regs_struct) -> RegisterSet {
                    RegisterSet { $($name: regs.$name,)* }
                }
            }

            impl From<RegisterSet> for user_regs_struct {
                fn from(regs: RegisterSet) -> user_regs_struct {
                    user_regs_struct { $($name: regs.$name,)* }
                }
            }
        };
    }

    register_set!(
        r15, r14, r13, r12, rbp, rbx, r11, r10, r9, r8, rax, rcx, rdx, rsi, rdi, orig_rax, rip,
        cs, eflags, rsp, ss, fs_base, gs_base, ds, es, fs, gs,
    );

    impl RegisterSet {
        /// Offset of a register inside of the tracee's user area, suitable for `peek_user`.
        pub fn user_offset(name: &str) -> Option<usize> {
            Self::NAMES
                .iter()
                .position(|n| *n == name)
                .map(|index| index * std::mem::size_of::<u64>())
        }
    }

    impl super::Registers for RegisterSet {
        fn ip(&self) -> u64 {
            self.rip
        }

        fn sp(&self) -> u64 {
            self.rsp
        }

        fn bp(&self) -> Option<u64> {
            Some(self.rbp)
        }

        fn set_ip(&mut self, ip: u64) {
            self.rip = ip;
        }

        fn set_bp(&mut self, bp: u64) -> Option<()> {
            self.rbp = bp;
            Some(())
        }

        fn set_sp(&mut self, sp: u64) {
            self.rsp = sp;
        }

        fn reg_for_name(&self, name: &str) -> Option<u64> {
            self.value(name)
        }

        fn set_reg_for_name(&mut self, name: &str, val: u64) -> Option<()> {
            *self.slot(name)? = val;
            Some(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::RegisterSet;
        use crate::target::Registers;
        use libc::user_regs_struct;
        use std::mem::{offset_of, size_of};

        #[test]
        fn layout_matches_user_regs_struct() {
            assert_eq!(size_of::<RegisterSet>(), 27 * 8);
            assert_eq!(size_of::<RegisterSet>(), size_of::<user_regs_struct>());
            assert_eq!(RegisterSet::NAMES.len(), 27);

            assert_eq!(offset_of!(RegisterSet, r15), 0);
            assert_eq!(offset_of!(RegisterSet, rax), offset_of!(user_regs_struct, rax));
            assert_eq!(offset_of!(RegisterSet, orig_rax), offset_of!(user_regs_struct, orig_rax));
            assert_eq!(offset_of!(RegisterSet, rip), offset_of!(user_regs_struct, rip));
            assert_eq!(offset_of!(RegisterSet, eflags), offset_of!(user_regs_struct, eflags));
            assert_eq!(offset_of!(RegisterSet, fs_base), offset_of!(user_regs_struct, fs_base));
            assert_eq!(offset_of!(RegisterSet, gs), offset_of!(user_regs_struct, gs));
            assert_eq!(offset_of!(RegisterSet, gs), 26 * 8);
        }

        #[test]
        fn user_offsets_follow_layout() {
            assert_eq!(RegisterSet::user_offset("r15"), Some(0));
            assert_eq!(RegisterSet::user_offset("rax"), Some(offset_of!(RegisterSet, rax)));
            assert_eq!(RegisterSet::user_offset("rip"), Some(16 * 8));
            assert_eq!(RegisterSet::user_offset("xmm0"), None);
        }

        #[test]
        fn converts_and_names_registers() {
            let mut regs = RegisterSet::default();
            regs.set_ip(0x401000);
            assert!(regs.set_reg_for_name("rdi", 7).is_some());
            assert!(regs.set_reg_for_name("bogus", 1).is_none());

            let raw: user_regs_struct = regs.into();
            assert_eq!(raw.rip, 0x401000);
            assert_eq!(raw.rdi, 7);

            let back = RegisterSet::from(raw);
            assert_eq!(back, regs);
            assert_eq!(back.reg_for_name("rdi"), Some(7));
            assert_eq!(back.to_words()[16], 0x401000);
        }
    }
}
