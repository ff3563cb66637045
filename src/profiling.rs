//! Chrome trace output for decode runs, behind the `profiling` feature.
//!
//! With the feature enabled, the session emits `decode_step` and `reorder`
//! spans and the pipeline emits `condition` and `decode` spans. [`init`]
//! routes them to a trace file that opens in `chrome://tracing` or
//! [Perfetto](https://ui.perfetto.dev). Without the feature the spans compile
//! away and [`init`] returns `None`.

use std::path::Path;

/// Default trace file, relative to the working directory.
pub const DEFAULT_TRACE_FILE: &str = "musicgen-trace.json";

/// Flushes the trace file when dropped. Hold it until the run ends.
#[cfg(feature = "profiling")]
pub struct ProfilingGuard {
    _guard: tracing_chrome::FlushGuard,
}

#[cfg(not(feature = "profiling"))]
pub struct ProfilingGuard;

/// Install the Chrome trace subscriber writing to [`DEFAULT_TRACE_FILE`].
///
/// ```rust,ignore
/// let _guard = musicgen_delay::profiling::init();
/// musicgen.synthesize(prompt, &options, &cancel, |_| {})?;
/// ```
pub fn init() -> Option<ProfilingGuard> {
    init_with_file(DEFAULT_TRACE_FILE)
}

/// Install the Chrome trace subscriber writing to `path`.
///
/// Returns `None` when the feature is off or a global subscriber is already
/// installed.
pub fn init_with_file<P: AsRef<Path>>(path: P) -> Option<ProfilingGuard> {
    #[cfg(feature = "profiling")]
    {
        use tracing_chrome::ChromeLayerBuilder;
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let path = path.as_ref();
        let (chrome_layer, guard) = ChromeLayerBuilder::new()
            .file(path)
            .include_args(true)
            .build();

        if tracing_subscriber::registry()
            .with(chrome_layer)
            .try_init()
            .is_err()
        {
            tracing::warn!("Tracing subscriber already set, profiling disabled");
            return None;
        }

        tracing::info!("Profiling enabled, trace will be written to {}", path.display());
        Some(ProfilingGuard { _guard: guard })
    }

    #[cfg(not(feature = "profiling"))]
    {
        let _ = path;
        None
    }
}
