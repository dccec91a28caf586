use std::sync::atomic::{AtomicUsize, Ordering};

/// Hands out core ids round-robin to pool workers that ask to be pinned.
#[derive(Debug)]
pub struct CoreCursor {
    ids: Vec<usize>,
    next: AtomicUsize,
}

impl CoreCursor {
    /// Builds a cursor over every core id reported by the OS.
    pub fn from_system() -> anyhow::Result<Self> {
        let ids = system_core_ids()?;
        if ids.is_empty() {
            anyhow::bail!("No CPU cores reported by OS");
        }
        Ok(Self {
            ids,
            next: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn next_core(&self) -> usize {
        let slot = self.next.fetch_add(1, Ordering::Relaxed);
        self.ids[slot % self.ids.len()]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn system_core_ids() -> anyhow::Result<Vec<usize>> {
    use anyhow::Context;

    let ids = core_affinity::get_core_ids()
        .context("core_affinity::get_core_ids() failed or returned None")?;
    Ok(ids.into_iter().map(|c| c.id).collect())
}

#[cfg(target_arch = "wasm32")]
fn system_core_ids() -> anyhow::Result<Vec<usize>> {
    anyhow::bail!("core ids are not available on this target")
}

#[cfg(not(target_arch = "wasm32"))]
pub fn try_pin_core(core_id: usize) -> anyhow::Result<usize> {
    use core_affinity::{CoreId, get_core_ids, set_for_current};

    if let Some(core_ids) = get_core_ids()
        && core_ids.iter().any(|c| c.id == core_id)
        && set_for_current(CoreId { id: core_id })
    {
        return Ok(core_id);
    }
    Err(anyhow::anyhow!("failed to pin core {core_id}"))
}

#[cfg(target_arch = "wasm32")]
pub fn try_pin_core(core_id: usize) -> anyhow::Result<usize> {
    Err(anyhow::anyhow!("failed to pin core {core_id}: unsupported target"))
}
