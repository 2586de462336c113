// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Builds the legacy MP tables some guest kernels still probe for even when
//! booted via the Linux boot protocol rather than BIOS, describing the
//! single local APIC and ISA bus this VMM exposes.

use std::mem;

use vm_memory::{Address, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

use super::mpspec::*;

// Where the MP floating pointer structure is written. Must sit below 1MB and
// be 16-byte aligned.
const MPTABLE_START: u64 = 0x9fc00;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("the guest has too many CPUs to fit on one MP bus ({0})")]
    TooManyCpus(u8),
    #[error("MP table does not fit in guest memory")]
    NotEnoughMemory,
    #[error("failed to write the MP floating pointer structure")]
    WriteMpfIntel,
    #[error("failed to write the MP config table header")]
    WriteMpcTable,
    #[error("failed to write an MP CPU entry")]
    WriteMpcCpu,
    #[error("failed to write the MP bus entry")]
    WriteMpcBus,
    #[error("failed to write the MP local interrupt entry")]
    WriteMpcLintsrc,
}

pub type Result<T> = std::result::Result<T, Error>;

fn compute_checksum<T: Copy>(v: &T) -> u8 {
    // SAFETY: any `T` handed here is one of our repr(C, packed) mpspec
    // structs, which are plain data with no padding-sensitive invariants.
    let v_slice = unsafe {
        std::slice::from_raw_parts(v as *const T as *const u8, mem::size_of::<T>())
    };
    let mut checksum: u8 = 0;
    for &b in v_slice {
        checksum = checksum.wrapping_add(b);
    }
    (!checksum).wrapping_add(1)
}

fn mpf_intel_compute_checksum(v: &mpf_intel) -> u8 {
    let sum = compute_checksum(v).wrapping_sub(v.checksum);
    (!sum).wrapping_add(1)
}

fn compute_mpc_table_checksum(v: &mpc_table) -> i8 {
    compute_checksum(v) as i8
}

/// Writes the MP floating pointer structure and config table into guest
/// memory at [`MPTABLE_START`], describing `num_cpus` local APICs with IDs
/// `0..num_cpus` and a single ISA bus with no IOAPIC (this VMM routes
/// interrupts through `KVM_IRQ_LINE` directly, not an emulated IOAPIC).
pub fn setup_mptable(mem: &GuestMemoryMmap, num_cpus: u8) -> Result<()> {
    if num_cpus >= MP_APIC_ALL {
        return Err(Error::TooManyCpus(num_cpus));
    }

    let base_mp = GuestAddress(MPTABLE_START);
    let mpf_intel_size = mem::size_of::<mpf_intel>();
    if mem.checked_offset(base_mp, mpf_intel_size).is_none() {
        return Err(Error::NotEnoughMemory);
    }

    let mut mpc_table = mpc_table {
        signature: MPC_SIGNATURE,
        spec: MPC_SPEC,
        oem: *b"MICROKVM",
        productid: *b"000000000000",
        lapic: 0xfee0_0000,
        ..Default::default()
    };

    let table_base = base_mp.unchecked_add(mpf_intel_size as u64);
    let mut offset = table_base.unchecked_add(mem::size_of::<mpc_table>() as u64);
    let mut entry_count = 0u16;

    for cpu_id in 0..num_cpus {
        let cpu = mpc_cpu {
            type_: MP_PROCESSOR,
            apicid: cpu_id,
            apicver: 0x14,
            cpuflag: CPU_ENABLEFLAG | if cpu_id == 0 { CPU_BOOTFLAG } else { 0 },
            cpufeature: CPU_STEPPING,
            featureflag: CPU_FEATURE_APIC | CPU_FEATURE_FPU,
            ..Default::default()
        };
        mem.write_obj(cpu, offset).map_err(|_| Error::WriteMpcCpu)?;
        offset = offset.unchecked_add(mem::size_of::<mpc_cpu>() as u64);
        entry_count += 1;
    }

    let bus = mpc_bus {
        type_: MP_BUS,
        busid: 0,
        bustype: BUSTYPE_ISA,
    };
    mem.write_obj(bus, offset).map_err(|_| Error::WriteMpcBus)?;
    offset = offset.unchecked_add(mem::size_of::<mpc_bus>() as u64);
    entry_count += 1;

    let lint = mpc_lintsrc {
        type_: MP_LINTSRC,
        irqtype: MP_IRQDIR_DEFAULT,
        srcbusid: 0,
        destapic: MP_APIC_ALL,
        destapiclint: 0,
        ..Default::default()
    };
    mem.write_obj(lint, offset).map_err(|_| Error::WriteMpcLintsrc)?;
    offset = offset.unchecked_add(mem::size_of::<mpc_lintsrc>() as u64);
    entry_count += 1;

    let lint1 = mpc_lintsrc {
        type_: MP_LINTSRC,
        irqtype: MP_IRQDIR_DEFAULT,
        srcbusid: 0,
        destapic: MP_APIC_ALL,
        destapiclint: 1,
        ..Default::default()
    };
    mem.write_obj(lint1, offset).map_err(|_| Error::WriteMpcLintsrc)?;
    offset = offset.unchecked_add(mem::size_of::<mpc_lintsrc>() as u64);
    entry_count += 1;

    mpc_table.oemcount = entry_count;
    mpc_table.length = (offset.raw_value() - table_base.raw_value()) as u16;
    mpc_table.checksum = compute_mpc_table_checksum(&mpc_table);
    mem.write_obj(mpc_table, table_base)
        .map_err(|_| Error::WriteMpcTable)?;

    let mut mpf = mpf_intel {
        signature: MPF_SIGNATURE,
        physptr: table_base.raw_value() as u32,
        length: 1,
        specification: 4,
        ..Default::default()
    };
    mpf.checksum = mpf_intel_compute_checksum(&mpf);
    mem.write_obj(mpf, base_mp).map_err(|_| Error::WriteMpfIntel)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_memory::GuestMemoryMmap;

    #[test]
    fn single_cpu_table_is_written_without_error() {
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x1000_0000)]).unwrap();
        assert!(setup_mptable(&mem, 1).is_ok());
    }

    #[test]
    fn too_many_cpus_is_rejected() {
        let mem = GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x1000_0000)]).unwrap();
        assert!(matches!(
            setup_mptable(&mem, 255),
            Err(Error::TooManyCpus(_))
        ));
    }
}
