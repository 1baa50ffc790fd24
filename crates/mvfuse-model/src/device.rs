//! Compute device selection: CUDA > Metal > CPU.

use candle_core::Device;

/// Select the device the composed model runs on.
///
/// With `force_cpu` unset, tries CUDA (when compiled with the `cuda`
/// feature), then Metal (`metal` feature), then falls back to CPU.
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        return Device::Cpu;
    }

    #[cfg(feature = "cuda")]
    {
        match Device::new_cuda(0) {
            Ok(device) => {
                tracing::info!("Finetuning on CUDA device 0");
                return device;
            }
            Err(e) => tracing::warn!(error = %e, "CUDA requested but unavailable, falling back"),
        }
    }

    #[cfg(feature = "metal")]
    {
        match Device::new_metal(0) {
            Ok(device) => {
                tracing::info!("Finetuning on Metal device 0");
                return device;
            }
            Err(e) => tracing::warn!(error = %e, "Metal requested but unavailable, falling back"),
        }
    }

    Device::Cpu
}

/// Short name of a device for log fields.
pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}
