//! Chip description: address-format constants, structural parameters and
//! the CSR offsets the core needs by name.
//!
//! The full register map belongs to the platform layer; only the offsets
//! the runtime itself touches are listed here, grouped the way the hardware
//! blocks group them.

pub use axion_pack::Chip;

// -- Device virtual address format --------------------------------------------
//
// Simple addressing:
// [63] | [62:25]         | [24:12]          | [11:0]
// 0    | Reserved [0...] | Page Table Index | Page Offset
//
// Extended addressing:
// [63] | [62:34]      | [33:21]           | [20:12]          | [11:0]
// 1    | Reserved [0] | Extended PT Index | Host Table Index | Page Offset

/// MSB distinguishing extended from simple addresses.
pub const EXTENDED_VIRTUAL_ADDRESS_BIT: u64 = 1 << 63;

/// Simple addressing: page-table index position.
pub const SIMPLE_PAGE_TABLE_INDEX_SHIFT: u64 = 12;
/// Simple addressing: page-table index width.
pub const SIMPLE_PAGE_TABLE_INDEX_WIDTH: u64 = 13;

/// Extended addressing: extended-table index position.
pub const EXTENDED_PAGE_TABLE_INDEX_SHIFT: u64 = 21;
/// Extended addressing: extended-table index width.
pub const EXTENDED_PAGE_TABLE_INDEX_WIDTH: u64 = 13;
/// Extended addressing: host-table index width.
pub const EXTENDED_HOST_PAGE_TABLE_INDEX_WIDTH: u64 = 9;
/// Host-table entries reachable through one extended entry.
pub const EXTENDED_HOST_PAGE_TABLE_SIZE_PER_PAGE: u64 =
    1 << EXTENDED_HOST_PAGE_TABLE_INDEX_WIDTH;

/// Bytes addressable by one extended page-table entry (2 MiB with 4 KiB
/// pages).
pub const EXTENDED_PAGE_TABLE_ENTRY_ADDRESSABLE_BYTES: u64 =
    EXTENDED_HOST_PAGE_TABLE_SIZE_PER_PAGE * crate::memory::util::HOST_PAGE_SIZE;

/// First address of the extended segment.
pub const EXTENDED_ADDRESS_SPACE_START: u64 = 0x8000_0000_0000_0000;

/// Size of the extended segment. Restricted to 4 GiB so the scalar core
/// can do 32-bit address math, and must not cross a 4 GiB boundary.
pub const EXTENDED_ADDRESS_SPACE_SIZE_BYTES: u64 = 4096 * 1024 * 1024;

const _: () = assert!(
    (EXTENDED_ADDRESS_SPACE_START >> 32)
        == ((EXTENDED_ADDRESS_SPACE_START + EXTENDED_ADDRESS_SPACE_SIZE_BYTES - 1) >> 32),
    "extended address space must not span a 4 GiB boundary"
);
const _: () = assert!(
    EXTENDED_ADDRESS_SPACE_SIZE_BYTES % EXTENDED_PAGE_TABLE_ENTRY_ADDRESSABLE_BYTES == 0,
    "extended address space must be a whole number of extended entries"
);

/// Minimum entries reserved for the simple region (256 * 4 KiB = 1 MiB).
pub const MIN_SIMPLE_PAGE_TABLE_ENTRIES: usize = 256;

/// Maximum entries usable by the extended region (2048 * 2 MiB = 4 GiB).
pub const MAX_EXTENDED_PAGE_TABLE_ENTRIES: usize =
    (EXTENDED_ADDRESS_SPACE_SIZE_BYTES / EXTENDED_PAGE_TABLE_ENTRY_ADDRESSABLE_BYTES) as usize;

/// Entries assigned to the simple region for a table of
/// `num_page_table_entries`.
pub fn num_simple_page_table_entries(num_page_table_entries: usize) -> usize {
    num_page_table_entries
        .saturating_sub(MAX_EXTENDED_PAGE_TABLE_ENTRIES)
        .max(MIN_SIMPLE_PAGE_TABLE_ENTRIES)
}

/// Entries assigned to the extended region for a table of
/// `num_page_table_entries`.
pub fn num_extended_page_table_entries(num_page_table_entries: usize) -> usize {
    num_page_table_entries - num_simple_page_table_entries(num_page_table_entries)
}

// -- Structural parameters -----------------------------------------------------

/// Chip parameters that shape driver behavior.
#[derive(Debug, Clone, Copy)]
pub struct ChipStructures {
    /// Alignment for buffers allocated by the driver.
    pub allocation_alignment_bytes: usize,
    /// Minimum alignment user buffers need to avoid a staging copy.
    pub minimum_alignment_bytes: usize,
    /// Value programmed into the AXI DMA burst limiter.
    pub axi_dma_burst_limiter: u64,
    /// Total page-table entries, shared between simple and extended use.
    pub num_page_table_entries: usize,
    /// Number of top-level interrupt lines.
    pub num_top_level_interrupts: usize,
}

// -- CSR offsets ---------------------------------------------------------------

/// Host interface block offsets.
#[derive(Debug, Clone, Copy)]
pub struct HibCsrOffsets {
    /// Sticky fatal error status.
    pub hib_error_status: u64,
    /// First recorded fatal error.
    pub hib_first_error_status: u64,
    /// Write 1 to pause all DMA engines.
    pub dma_pause: u64,
    /// Reads 1 once all DMA engines are paused.
    pub dma_paused: u64,
    /// AXI DMA burst limiter.
    pub dma_burst_limiter: u64,
    /// Periodic status block update control.
    pub status_block_update: u64,
    /// Instruction queue ring base (device address).
    pub instruction_queue_base: u64,
    /// Instruction queue ring size in descriptors.
    pub instruction_queue_size: u64,
    /// Instruction queue producer tail.
    pub instruction_queue_tail: u64,
    /// Instruction queue status block base (device address).
    pub instruction_queue_status_block_base: u64,
    /// Instruction queue completion interrupt control.
    pub instruction_queue_int_control: u64,
    /// Number of simple page-table entries.
    pub page_table_size: u64,
    /// Fatal-error interrupt enable.
    pub fatal_error_int_enable: u64,
    /// Fatal-error interrupt status (write 1 to clear).
    pub fatal_error_int_status: u64,
    /// Top-level interrupt enable.
    pub top_level_int_enable: u64,
    /// Top-level interrupt status (write 1 to clear).
    pub top_level_int_status: u64,
}

/// Power, clock and reset control offsets.
#[derive(Debug, Clone, Copy)]
pub struct PowerCsrOffsets {
    /// Software clock gate enable.
    pub software_clock_gate: u64,
    /// Hardware (idle) clock gate enable.
    pub hardware_clock_gate: u64,
    /// Block reset control.
    pub reset: u64,
}

/// Scalar-core control offsets.
#[derive(Debug, Clone, Copy)]
pub struct ScalarCoreCsrOffsets {
    /// Run control for the scalar core.
    pub run_control: u64,
    /// Run control for the tile array.
    pub tile_run_control: u64,
    /// Host interrupt enable mask.
    pub host_interrupt_enable: u64,
    /// First of four host interrupt status registers (stride 8).
    pub host_interrupt_status_base: u64,
    /// First of four host interrupt count registers (stride 8).
    pub host_interrupt_count_base: u64,
}

/// Bulk-USB block offsets.
#[derive(Debug, Clone, Copy)]
pub struct UsbCsrOffsets {
    /// Descriptor-source enable mask per endpoint class.
    pub descr_ep: u64,
    /// Single/multiple bulk-out endpoint select.
    pub multi_bo_ep: u64,
    /// Outfeed chunk length in 8-byte units.
    pub outfeed_chunk_length: u64,
    /// Per-endpoint credit counters (software flow control).
    pub ep_status_credit: u64,
    /// Misc control used to latch credit snapshots.
    pub omc0_00: u64,
}

/// Everything the runtime needs to know about one chip.
#[derive(Debug, Clone, Copy)]
pub struct CsrLayout {
    /// Structural parameters.
    pub structures: ChipStructures,
    /// Host interface block.
    pub hib: HibCsrOffsets,
    /// Power and reset.
    pub power: PowerCsrOffsets,
    /// Scalar core.
    pub scalar: ScalarCoreCsrOffsets,
    /// USB bridge.
    pub usb: UsbCsrOffsets,
}

impl CsrLayout {
    /// Layout of the first-generation chip.
    pub fn a1() -> Self {
        Self {
            structures: ChipStructures {
                allocation_alignment_bytes: 4096,
                minimum_alignment_bytes: 8,
                axi_dma_burst_limiter: 0x8,
                num_page_table_entries: 8192,
                num_top_level_interrupts: 4,
            },
            hib: HibCsrOffsets {
                hib_error_status: 0x0150,
                hib_first_error_status: 0x0158,
                dma_pause: 0x0180,
                dma_paused: 0x0188,
                dma_burst_limiter: 0x0190,
                status_block_update: 0x0198,
                instruction_queue_base: 0x01A0,
                instruction_queue_size: 0x01A8,
                instruction_queue_tail: 0x01B0,
                instruction_queue_status_block_base: 0x01B8,
                instruction_queue_int_control: 0x01C8,
                page_table_size: 0x01C0,
                fatal_error_int_enable: 0x01D0,
                fatal_error_int_status: 0x01D8,
                top_level_int_enable: 0x01E0,
                top_level_int_status: 0x01E8,
            },
            power: PowerCsrOffsets {
                software_clock_gate: 0x2010,
                hardware_clock_gate: 0x2018,
                reset: 0x2020,
            },
            scalar: ScalarCoreCsrOffsets {
                run_control: 0x3000,
                tile_run_control: 0x3008,
                host_interrupt_enable: 0x30F8,
                host_interrupt_status_base: 0x3100,
                host_interrupt_count_base: 0x3140,
            },
            usb: UsbCsrOffsets {
                descr_ep: 0x4018,
                multi_bo_ep: 0x4020,
                outfeed_chunk_length: 0x4028,
                ep_status_credit: 0x4030,
                omc0_00: 0x40A0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_table_split_favors_extended() {
        // 8192 entries: 2048 go extended, the rest simple.
        assert_eq!(num_simple_page_table_entries(8192), 8192 - 2048);
        assert_eq!(num_extended_page_table_entries(8192), 2048);
    }

    #[test]
    fn small_tables_keep_the_simple_minimum() {
        assert_eq!(num_simple_page_table_entries(512), MIN_SIMPLE_PAGE_TABLE_ENTRIES);
        assert_eq!(
            num_extended_page_table_entries(512),
            512 - MIN_SIMPLE_PAGE_TABLE_ENTRIES
        );
    }
}
