// # Kernel Collaborator Client
//
// User-space half of the privileged pointer-chase measurement. A kernel
// module exposes `/dev/pointer_chasing`; one ioctl hands it a fixed-layout
// request, the module pins a kernel thread to the requested core, chases
// physical addresses on the requested node, and fills in the `out_*`
// fields. This module owns the request layout, the ioctl plumbing, the
// pre-flight geometry check, and the SIGINT-to-stop translation. The
// in-kernel side is implemented elsewhere.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use serde::Deserialize;

use crate::error::{BenchError, Result};
use crate::util::Logger;

const DEVICE_PATH: &str = "/dev/pointer_chasing";

/// Request/response carrier. Layout is part of the kernel ABI: twenty-one
/// u64 fields, inputs first, in exactly this order.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct PchasingArgs {
    pub block_num: u64,
    pub stride_size: u64,
    pub repeat: u64,
    pub core_id: u64,
    pub node_id: u64,
    pub use_flush: u64,
    pub flush_type: u64,
    pub access_order: u64,
    pub dimm_start_addr_phys: u64,
    pub cxl_start_addr_phys: u64,
    pub test_size: u64,
    pub snc_mode: u64,
    pub socket_num: u64,
    pub test_type: u64,
    pub ldst_type: u64,
    pub out_latency_cycle_ld: u64,
    pub out_latency_cycle_st: u64,
    pub out_total_cycle_ld: u64,
    pub out_total_cycle_st: u64,
    pub out_total_ns_ld: u64,
    pub out_total_ns_st: u64,
}

// ioctl request-code math: dir in bits 30-31, size in bits 16-29, type in
// bits 8-15, nr in bits 0-7.
const IOC_WRITE: u64 = 1;
const IOC_READ: u64 = 2;

const fn ioc(dir: u64, ty: u64, nr: u64, size: u64) -> u64 {
    (dir << 30) | (size << 16) | (ty << 8) | nr
}

const PCH_IOC_MAGIC: u64 = b'p' as u64;
pub const PCH_IOC_RUN: u64 = ioc(
    IOC_READ | IOC_WRITE,
    PCH_IOC_MAGIC,
    1,
    std::mem::size_of::<PchasingArgs>() as u64,
);
pub const PCH_IOC_STOP: u64 = ioc(0, PCH_IOC_MAGIC, 2, 0);

/// Device fd visible to the SIGINT handler; -1 while no run is in flight.
static ACTIVE_DEVICE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn sigint_handler(_sig: libc::c_int) {
    let fd = ACTIVE_DEVICE_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        // ioctl is async-signal-safe; ask the kernel thread to stop.
        unsafe {
            libc::ioctl(fd, PCH_IOC_STOP as libc::c_ulong);
        }
    }
}

/// Geometry must fit before anything is allocated or submitted: the chased
/// blocks cannot cover more than the test region.
pub fn preflight(args: &PchasingArgs) -> Result<()> {
    if args.block_num * args.stride_size >= args.test_size {
        return Err(BenchError::Config(format!(
            "block_num ({}) x stride_size ({}) must be smaller than test_size ({})",
            args.block_num, args.stride_size, args.test_size
        )));
    }
    Ok(())
}

#[derive(Debug)]
pub struct ChaseDevice {
    file: File,
}

impl ChaseDevice {
    pub fn open() -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(DEVICE_PATH)
            .map_err(|err| BenchError::KernelIoctl(format!("open {DEVICE_PATH}: {err}")))?;
        Ok(Self { file })
    }

    /// Submit one measurement. At most one request is in flight per open
    /// descriptor; SIGINT during the run is translated into a stop request.
    pub fn run(&self, args: &mut PchasingArgs) -> Result<()> {
        ACTIVE_DEVICE_FD.store(self.file.as_raw_fd(), Ordering::SeqCst);
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                PCH_IOC_RUN as libc::c_ulong,
                args as *mut PchasingArgs,
            )
        };
        ACTIVE_DEVICE_FD.store(-1, Ordering::SeqCst);
        if rc < 0 {
            return Err(BenchError::KernelIoctl(format!(
                "PCH_IOC_RUN: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), PCH_IOC_STOP as libc::c_ulong) };
        if rc < 0 {
            return Err(BenchError::KernelIoctl(format!(
                "PCH_IOC_STOP: {}",
                io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

/// Kernel-chase job file: physical-address geometry plus run controls.
#[derive(Debug, Deserialize)]
pub struct KernelJob {
    pub block_num: u64,
    pub stride_size: u64,
    pub repeat: u64,
    pub core_id: u64,
    pub node_id: u64,
    pub use_flush: u64,
    #[serde(default)]
    pub flush_type: u64,
    pub access_order: u64,
    pub dimm_start_addr_phys: u64,
    #[serde(default)]
    pub cxl_start_addr_phys: u64,
    pub test_size: u64,
    #[serde(default)]
    pub snc_mode: u64,
    #[serde(default)]
    pub socket_num: u64,
    #[serde(default)]
    pub test_type: u64,
    #[serde(default)]
    pub ldst_type: u64,
}

impl KernelJob {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|err| BenchError::Config(format!("failed to parse kernel job file: {err}")))
    }

    pub fn to_args(&self) -> PchasingArgs {
        PchasingArgs {
            block_num: self.block_num,
            stride_size: self.stride_size,
            repeat: self.repeat,
            core_id: self.core_id,
            node_id: self.node_id,
            use_flush: self.use_flush,
            flush_type: self.flush_type,
            access_order: self.access_order,
            dimm_start_addr_phys: self.dimm_start_addr_phys,
            cxl_start_addr_phys: self.cxl_start_addr_phys,
            test_size: self.test_size,
            snc_mode: self.snc_mode,
            socket_num: self.socket_num,
            test_type: self.test_type,
            ldst_type: self.ldst_type,
            ..Default::default()
        }
    }

    fn test_info(&self) -> String {
        let access_order = if self.access_order == 0 {
            "random"
        } else {
            "sequential"
        };
        let test_type = if self.test_type == 0 {
            "access latency"
        } else {
            "flush latency"
        };
        let flush_type = match self.flush_type {
            0 => "clflush",
            1 => "clflushopt",
            2 => "clwb",
            _ => "unknown",
        };
        let ldst_type = match self.ldst_type {
            0 => "temporal",
            1 => "non-temporal",
            2 => "atomic",
            _ => "unknown",
        };
        format!(
            "=============== Test Information ===============\n\
             Test Type: {test_type}\n\
             Number of Block: {}\n\
             Stride Size: {}\n\
             DIMM Start Physical Address: {:#x}\n\
             CXL Start Physical Address: {:#x}\n\
             Test Size: {}\n\
             SNC Mode: {}\n\
             Socket Number: {}\n\
             Repeat: {}\n\
             Core ID: {}\n\
             Node ID: {}\n\
             Use Flush: {}\n\
             Flush Type: {flush_type}\n\
             Access Order: {access_order}\n\
             Load/Store Type: {ldst_type}",
            self.block_num,
            self.stride_size,
            self.dimm_start_addr_phys,
            self.cxl_start_addr_phys,
            self.test_size,
            self.snc_mode,
            self.socket_num,
            self.repeat,
            self.core_id,
            self.node_id,
            self.use_flush,
        )
    }
}

/// Drive one kernel-chase job end to end and report the cycle/ns results.
pub fn run_job(logger: &mut Logger, job: &KernelJob) -> Result<()> {
    let mut args = job.to_args();
    preflight(&args)?;

    logger.append(&job.test_info());

    unsafe {
        libc::signal(
            libc::SIGINT,
            sigint_handler as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }

    let device = ChaseDevice::open()?;
    device.run(&mut args)?;

    let ns_per_cycle_st = ratio(args.out_total_ns_st, args.out_total_cycle_st);
    let ns_per_cycle_ld = ratio(args.out_total_ns_ld, args.out_total_cycle_ld);
    let latency_ns_st = args.out_latency_cycle_st as f64 * ns_per_cycle_st;
    let latency_ns_ld = args.out_latency_cycle_ld as f64 * ns_per_cycle_ld;

    let (store_label, load_label) = if args.test_type == 0 {
        ("Average Store Latency", "Average Load Latency")
    } else {
        ("Average Dirty Flush Latency", "Average Clean Flush Latency")
    };
    logger.append(&format!(
        "=============== Test Results ===============\n\
         {store_label}: {} cycles, {latency_ns_st:.3} ns\n\
         {load_label}: {} cycles, {latency_ns_ld:.3} ns",
        args.out_latency_cycle_st, args.out_latency_cycle_ld,
    ));
    Ok(())
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_struct_matches_the_kernel_abi() {
        assert_eq!(std::mem::size_of::<PchasingArgs>(), 21 * 8);
    }

    #[test]
    fn ioctl_codes_follow_the_encoding() {
        // _IOWR('p', 1, 168-byte struct)
        let expected_run = (3u64 << 30) | (168 << 16) | ((b'p' as u64) << 8) | 1;
        assert_eq!(PCH_IOC_RUN, expected_run);
        // _IO('p', 2)
        let expected_stop = ((b'p' as u64) << 8) | 2;
        assert_eq!(PCH_IOC_STOP, expected_stop);
    }

    #[test]
    fn preflight_rejects_oversized_geometry() {
        let mut args = PchasingArgs {
            block_num: 64,
            stride_size: 64,
            test_size: 4096,
            ..Default::default()
        };
        assert!(preflight(&args).is_err());

        args.test_size = 4097;
        preflight(&args).unwrap();
    }

    #[test]
    fn kernel_job_parses_with_optional_fields_defaulted() {
        let yaml = "block_num: 128\n\
                    stride_size: 64\n\
                    repeat: 4\n\
                    core_id: 2\n\
                    node_id: 0\n\
                    use_flush: 1\n\
                    access_order: 0\n\
                    dimm_start_addr_phys: 268435456\n\
                    test_size: 1048576\n";
        let job = KernelJob::from_yaml_str(yaml).unwrap();
        assert_eq!(job.block_num, 128);
        assert_eq!(job.cxl_start_addr_phys, 0);
        let args = job.to_args();
        assert_eq!(args.dimm_start_addr_phys, 268435456);
        assert_eq!(args.out_total_ns_ld, 0);
    }

    #[test]
    fn missing_device_reports_kernel_ioctl_error() {
        if std::path::Path::new(DEVICE_PATH).exists() {
            return;
        }
        let err = ChaseDevice::open().unwrap_err();
        assert!(matches!(err, BenchError::KernelIoctl(_)));
    }
}
