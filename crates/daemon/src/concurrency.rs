//! Concurrency planning for the transcoder
//!
//! Derives the worker pool size and the global encoder process limit from the
//! CPU core count and configuration.

use crate::config::Config;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Target number of threads to use based on utilization
    pub target_threads: u32,
    /// Jobs the worker pool leases concurrently
    pub job_slots: u32,
    /// Encoder processes allowed at once across all jobs
    pub encoder_processes: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - Clamps target_cpu_utilization to [0.5, 1.0]
    /// - Derives encoder_processes as half the target threads, at least 1 (unless explicit)
    /// - Derives job_slots: 4 for 16+ cores, 2 otherwise (unless explicit)
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .cpu
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32);

        let clamped_utilization = clamp_utilization(cfg.cpu.target_cpu_utilization);
        let target_threads = ((total_cores as f32) * clamped_utilization).round() as u32;

        let encoder_processes = if cfg.encoder.max_processes > 0 {
            cfg.encoder.max_processes
        } else {
            derive_encoder_processes(target_threads)
        };

        let job_slots = if cfg.workers.job_slots > 0 {
            cfg.workers.job_slots
        } else {
            derive_job_slots(total_cores)
        };

        Self {
            total_cores,
            target_threads,
            job_slots,
            encoder_processes,
        }
    }
}

/// Each x264 process is itself multithreaded, so two threads per process.
fn derive_encoder_processes(target_threads: u32) -> u32 {
    (target_threads / 2).max(1)
}

fn derive_job_slots(cores: u32) -> u32 {
    if cores >= 16 {
        4
    } else {
        2
    }
}

/// Clamp utilization to valid range [0.5, 1.0]
fn clamp_utilization(util: f32) -> f32 {
    util.clamp(0.5, 1.0)
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuConfig;
    use proptest::prelude::*;

    fn config_with(cores: u32, utilization: f32, job_slots: u32, max_processes: u32) -> Config {
        let mut cfg = Config::default();
        cfg.cpu = CpuConfig {
            logical_cores: Some(cores),
            target_cpu_utilization: utilization,
        };
        cfg.workers.job_slots = job_slots;
        cfg.encoder.max_processes = max_processes;
        cfg
    }

    // Property: with nothing explicit, the plan follows the core count.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_concurrency_derivation(cores in 1u32..256) {
            let plan = derive_plan(&config_with(cores, 0.85, 0, 0));

            prop_assert_eq!(plan.total_cores, cores);

            let expected_slots = if cores >= 16 { 4 } else { 2 };
            prop_assert_eq!(plan.job_slots, expected_slots);

            prop_assert!(plan.encoder_processes >= 1);
            prop_assert_eq!(plan.encoder_processes, (plan.target_threads / 2).max(1));
        }
    }

    // Property: explicit non-zero values are used unchanged.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_explicit_config_override(
            cores in 1u32..256,
            explicit_slots in 1u32..32,
            explicit_processes in 1u32..64,
        ) {
            let plan = derive_plan(&config_with(cores, 0.85, explicit_slots, explicit_processes));

            prop_assert_eq!(plan.job_slots, explicit_slots);
            prop_assert_eq!(plan.encoder_processes, explicit_processes);
        }
    }

    // Property: utilization is clamped to [0.5, 1.0] before threads are derived.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_utilization_clamping(
            cores in 1u32..256,
            raw_utilization in -1.0f32..3.0,
        ) {
            let plan = derive_plan(&config_with(cores, raw_utilization, 0, 0));

            let clamped = raw_utilization.clamp(0.5, 1.0);
            let expected_target_threads = ((cores as f32) * clamped).round() as u32;
            prop_assert_eq!(plan.target_threads, expected_target_threads);

            let min_threads = ((cores as f32) * 0.5).round() as u32;
            prop_assert!(plan.target_threads >= min_threads && plan.target_threads <= cores);
        }
    }

    #[test]
    fn test_single_core_still_gets_one_encoder() {
        let plan = derive_plan(&config_with(1, 0.5, 0, 0));
        assert_eq!(plan.encoder_processes, 1);
        assert_eq!(plan.job_slots, 2);
    }
}
