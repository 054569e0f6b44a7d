//! VM settings.
//!
//! Everything the command line can change lives in [`VmSettings`]. The
//! settings are validated once at boot and then copied into the parts of
//! the VM that read them.

use std::path::PathBuf;

use bitflags::bitflags;

/// Which RAM collector manages the young segment. Exactly one is active for
/// the lifetime of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectorKind {
    /// Two-space copying collector.
    Cheney,
    /// Mark-compact collector with a write barrier and partial collections.
    #[default]
    Lisp2,
}

bitflags! {
    /// Per-subsystem tracing switches. Each flag raises the log level of the
    /// matching `squawk::*` log target.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TraceFlags: u16 {
        const INSTRUCTIONS      = 1 << 0;
        const METHODS           = 1 << 1;
        const ALLOCATION        = 1 << 2;
        const FRAMES            = 1 << 3;
        const GC                = 1 << 4;
        const GC_VERBOSE        = 1 << 5;
        const GC_SUMMARY        = 1 << 6;
        const MIGRATION         = 1 << 7;
        const MIGRATION_VERBOSE = 1 << 8;
        const IMAGE             = 1 << 9;
        const EEPROM_GC         = 1 << 10;
    }
}

impl TraceFlags {
    /// `(log target, flag)` pairs used when building the logger filter.
    pub const TARGETS: [(&'static str, TraceFlags); 6] = [
        ("squawk::interp", TraceFlags::INSTRUCTIONS.union(TraceFlags::METHODS).union(TraceFlags::FRAMES)),
        ("squawk::alloc", TraceFlags::ALLOCATION),
        ("squawk::gc", TraceFlags::GC.union(TraceFlags::GC_VERBOSE).union(TraceFlags::GC_SUMMARY)),
        ("squawk::migration", TraceFlags::MIGRATION.union(TraceFlags::MIGRATION_VERBOSE)),
        ("squawk::image", TraceFlags::IMAGE),
        ("squawk::eeprom", TraceFlags::EEPROM_GC),
    ];

    /// Whether any flag in the set asks for the most detailed output.
    pub fn is_verbose(self) -> bool {
        self.intersects(
            TraceFlags::INSTRUCTIONS
                | TraceFlags::GC_VERBOSE
                | TraceFlags::MIGRATION_VERBOSE,
        )
    }
}

/// Configuration of a VM instance.
#[derive(Debug, Clone)]
pub struct VmSettings {
    /// Collector used for RAM.
    pub collector: CollectorKind,
    /// Size of the ideal young generation as a percentage of RAM object
    /// memory (mark-compact only).
    pub young_percent: u32,
    /// Always collect the whole of RAM (mark-compact only).
    pub full_gc: bool,
    /// Disables time slice preemption of guest threads.
    pub no_yield: bool,
    /// Fail every allocation that was not preceded by a collection.
    pub excessive_gc: bool,
    /// Like `excessive_gc`, but also never reuses stack chunks and sizes new
    /// chunks exactly.
    pub very_excessive_gc: bool,
    /// Log counters when the VM exits.
    pub stats: bool,
    /// Write `<base><n>.image` after every collection.
    pub checkpoint: Option<PathBuf>,
    pub trace: TraceFlags,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            collector: CollectorKind::Lisp2,
            young_percent: 10, // 10% of RAM
            full_gc: false,
            no_yield: false,
            excessive_gc: false,
            very_excessive_gc: false,
            stats: false,
            checkpoint: None,
            trace: TraceFlags::empty(),
        }
    }
}

impl VmSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.young_percent == 0 || self.young_percent > 100 {
            return Err("young_percent must be between 1 and 100");
        }
        if self.very_excessive_gc && !self.excessive_gc {
            return Err("very_excessive_gc requires excessive_gc");
        }
        if self.collector == CollectorKind::Cheney && self.full_gc {
            return Err("full_gc only applies to the mark-compact collector");
        }
        if let Some(base) = &self.checkpoint {
            if base.as_os_str().is_empty() {
                return Err("checkpoint base must not be empty");
            }
        }
        Ok(())
    }

    pub fn tracing(&self, flags: TraceFlags) -> bool {
        self.trace.intersects(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_settings() -> VmSettings {
        VmSettings {
            young_percent: 25,
            stats: true,
            ..Default::default()
        }
    }

    #[test]
    fn default_settings_are_valid() {
        assert!(VmSettings::default().validate().is_ok());
        assert!(create_test_settings().validate().is_ok());
    }

    #[test]
    fn young_percent_bounds() {
        let mut settings = create_test_settings();
        settings.young_percent = 0;
        assert_eq!(
            settings.validate(),
            Err("young_percent must be between 1 and 100")
        );
        settings.young_percent = 101;
        assert!(settings.validate().is_err());
        settings.young_percent = 100;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn stress_modes_must_nest() {
        let mut settings = create_test_settings();
        settings.very_excessive_gc = true;
        assert!(settings.validate().is_err());
        settings.excessive_gc = true;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn full_gc_is_mark_compact_only() {
        let settings = VmSettings {
            collector: CollectorKind::Cheney,
            full_gc: true,
            ..Default::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn empty_checkpoint_base_is_rejected() {
        let settings = VmSettings {
            checkpoint: Some(PathBuf::new()),
            ..Default::default()
        };
        assert_eq!(settings.validate(), Err("checkpoint base must not be empty"));
    }

    #[test]
    fn trace_flag_queries() {
        let settings = VmSettings {
            trace: TraceFlags::GC | TraceFlags::MIGRATION_VERBOSE,
            ..Default::default()
        };
        assert!(settings.tracing(TraceFlags::GC));
        assert!(!settings.tracing(TraceFlags::IMAGE));
        assert!(settings.trace.is_verbose());
        assert!(!TraceFlags::GC.is_verbose());
    }
}
