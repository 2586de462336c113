// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! CPUID leaf adjustments applied on top of whatever the host returns from
//! `KVM_GET_SUPPORTED_CPUID`. With only a single vCPU supported, this is
//! limited to stamping the correct initial APIC ID -- no topology leaves
//! need rewriting for SMP.

use kvm_bindings::CpuId;

const LEAF_0X1: u32 = 0x1;
const EBX_INITIAL_APIC_ID_SHIFT: u32 = 24;

/// Sets the initial APIC ID (CPUID.01H:EBX[31:24]) to `cpu_index` on every
/// matching leaf. `cpu_count` is accepted for symmetry with the multi-vCPU
/// form this was adapted from; single-vCPU guests always pass `cpu_index ==
/// 0, cpu_count == 1`.
pub fn filter_cpuid(cpu_index: usize, cpu_count: usize, cpuid: &mut CpuId) {
    debug_assert!(cpu_index < cpu_count);

    for entry in cpuid.as_mut_slice().iter_mut() {
        if entry.function == LEAF_0X1 {
            entry.ebx &= !(0xff << EBX_INITIAL_APIC_ID_SHIFT);
            entry.ebx |= (cpu_index as u32) << EBX_INITIAL_APIC_ID_SHIFT;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_bindings::kvm_cpuid_entry2;

    #[test]
    fn stamps_initial_apic_id() {
        let entries = vec![kvm_cpuid_entry2 {
            function: LEAF_0X1,
            ebx: 0x12_345678,
            ..Default::default()
        }];
        let mut cpuid = CpuId::from_entries(&entries).unwrap();

        filter_cpuid(0, 1, &mut cpuid);

        assert_eq!(
            (cpuid.as_mut_slice()[0].ebx >> EBX_INITIAL_APIC_ID_SHIFT) & 0xff,
            0
        );
    }
}
