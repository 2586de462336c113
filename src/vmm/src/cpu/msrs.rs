// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Boot-time MSR entries, mirroring the small set every rust-vmm reference
//! VMM programs before the first `KVM_RUN`.

use kvm_bindings::{kvm_msr_entry, Msrs};

use super::msr_index::*;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to allocate MSR list: {0}")]
    Fam(vmm_sys_util::fam::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Model specific registers that must be set before the vCPU's first run:
/// the SYSENTER/SYSCALL triple and EFER (so long mode sticks once CR0.PG is
/// set in `configure_sregs`).
pub fn create_boot_msr_entries() -> Result<Msrs> {
    let entries = vec![
        kvm_msr_entry {
            index: MSR_IA32_SYSENTER_CS,
            data: 0x0,
            ..Default::default()
        },
        kvm_msr_entry {
            index: MSR_IA32_SYSENTER_ESP,
            data: 0x0,
            ..Default::default()
        },
        kvm_msr_entry {
            index: MSR_IA32_SYSENTER_EIP,
            data: 0x0,
            ..Default::default()
        },
        kvm_msr_entry {
            index: MSR_STAR,
            data: 0x0,
            ..Default::default()
        },
        kvm_msr_entry {
            index: MSR_CSTAR,
            data: 0x0,
            ..Default::default()
        },
        kvm_msr_entry {
            index: MSR_KERNEL_GS_BASE,
            data: 0x0,
            ..Default::default()
        },
        kvm_msr_entry {
            index: MSR_SYSCALL_MASK,
            data: 0x0,
            ..Default::default()
        },
        kvm_msr_entry {
            index: MSR_LSTAR,
            data: 0x0,
            ..Default::default()
        },
        kvm_msr_entry {
            index: MSR_EFER,
            data: EFER_SCE,
            ..Default::default()
        },
    ];

    Msrs::from_entries(&entries).map_err(Error::Fam)
}
