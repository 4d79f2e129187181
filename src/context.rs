//! The allocation service.
//!
//! [`BufSurfaceContext`] is the entry point for everything that creates,
//! releases or touches surfaces. It owns the device runtime handle and the
//! header arena; build one per process (or per test) and share it.
//!
//! ```rust
//! use bufsurface::prelude::*;
//! use std::sync::Arc;
//!
//! let ctx = BufSurfaceContext::new(Arc::new(SimulatedRuntime::new(SimulatedConfig::unified())));
//! let params = CreateParams::frame(MemType::Default, 1920, 1080, ColorFormat::Nv12);
//! let pool = ctx.pool_create(&params, 6)?;
//! assert_eq!(pool.mem_type(), MemType::Unified);
//!
//! let mut surface = ctx.create_from_pool(&pool)?;
//! ctx.memset(&mut surface, Select::All, Select::All, 0x10)?;
//! ctx.destroy(surface)?;
//! ctx.pool_destroy(&pool)?;
//! # Ok::<(), bufsurface::Error>(())
//! ```

use crate::allocator::Allocator;
use crate::config::ContextConfig;
use crate::error::{Error, Result};
use crate::format::PlaneInfo;
use crate::observability;
use crate::params::{CreateParams, MemType, Select, check_params};
use crate::platform::{Addr, CacheOp, CopyDirection, DeviceRuntime};
use crate::pool::MemPool;
use crate::surface::{ArenaStats, HeaderArena, Owner, SlotParams, Surface};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// Allocation-service façade over one device runtime.
#[derive(Debug, Clone)]
pub struct BufSurfaceContext {
    runtime: Arc<dyn DeviceRuntime>,
    arena: Arc<HeaderArena>,
    config: ContextConfig,
}

impl BufSurfaceContext {
    /// Create a context with the default configuration.
    pub fn new(runtime: Arc<dyn DeviceRuntime>) -> Self {
        Self::with_config(runtime, ContextConfig::default())
    }

    /// Create a context with an explicit configuration.
    pub fn with_config(runtime: Arc<dyn DeviceRuntime>, config: ContextConfig) -> Self {
        observability::init_metrics();
        let arena = Arc::new(HeaderArena::new(
            config.header_capacity,
            config.preallocate_headers,
        ));
        Self {
            runtime,
            arena,
            config,
        }
    }

    /// Device runtime.
    pub fn runtime(&self) -> &Arc<dyn DeviceRuntime> {
        &self.runtime
    }

    /// Configuration the context was built with.
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Header reuse statistics.
    pub fn arena_stats(&self) -> ArenaStats {
        self.arena.stats()
    }

    pub(crate) fn arena(&self) -> &Arc<HeaderArena> {
        &self.arena
    }

    /// Create a pool of `block_count` blocks.
    pub fn pool_create(&self, params: &CreateParams, block_count: u32) -> Result<Arc<MemPool>> {
        MemPool::create(self.runtime.clone(), params, block_count)
    }

    /// Destroy a pool, waiting for its outstanding surfaces.
    pub fn pool_destroy(&self, pool: &MemPool) -> Result<()> {
        pool.destroy()
    }

    /// Take one surface from `pool`.
    pub fn create_from_pool(&self, pool: &Arc<MemPool>) -> Result<Surface> {
        let block = pool.alloc()?;
        Ok(Surface::from_block(
            self.arena.clone(),
            block,
            Owner::Pool(pool.clone()),
        ))
    }

    /// Create a standalone surface.
    ///
    /// Its memory is released as soon as the surface is. VB memory is only
    /// available from pools.
    pub fn create(&self, params: &CreateParams) -> Result<Surface> {
        check_params(self.runtime.as_ref(), params)?;

        let mut params = params.clone();
        if params.mem_type != MemType::System {
            self.runtime.set_device(params.device_id)?;
            let info = self.runtime.platform_info(params.device_id)?;
            params.mem_type = params.mem_type.resolve(&info);
        }
        if params.mem_type.is_vb() {
            error!(mem_type = ?params.mem_type, "video-buffer memory requires a pool");
            return Err(Error::UnsupportedOperation(
                "video-buffer surfaces can only be created from a pool".into(),
            ));
        }

        let allocator = Allocator::create(self.runtime.clone(), &params, 1)?;
        let block = allocator.alloc()?;
        trace!(mem_type = ?params.mem_type, batch_size = params.batch_size, "one-shot surface");
        Ok(Surface::from_block(
            self.arena.clone(),
            block,
            Owner::OneShot(allocator),
        ))
    }

    /// Release a surface, reporting any failure.
    ///
    /// Dropping a surface has the same effect but only logs failures.
    pub fn destroy(&self, surface: Surface) -> Result<()> {
        surface.release()
    }

    /// Invalidate the CPU cache so the CPU sees what the device wrote.
    ///
    /// Only cached kinds need this; every other kind is rejected with
    /// [`Error::UnsupportedOperation`].
    pub fn sync_for_cpu(&self, surface: &Surface, index: Select, plane: Select) -> Result<()> {
        self.cache_sync(CacheOp::Invalidate, surface, index, plane)
    }

    /// Flush the CPU cache so the device sees what the CPU wrote.
    pub fn sync_for_device(&self, surface: &Surface, index: Select, plane: Select) -> Result<()> {
        self.cache_sync(CacheOp::Flush, surface, index, plane)
    }

    fn cache_sync(&self, op: CacheOp, surface: &Surface, index: Select, plane: Select) -> Result<()> {
        let mem_type = surface.mem_type();
        if !mem_type.is_cached() {
            debug!(?mem_type, ?op, "cache maintenance not applicable");
            return Err(Error::UnsupportedOperation(format!(
                "{mem_type:?} memory needs no cache maintenance"
            )));
        }
        let slots = index.range(surface.batch_size())?;
        self.runtime.set_device(surface.device_id())?;

        for i in slots {
            let slot = slot_at(surface, i)?;
            let mapped = slot.mapped_ptr().ok_or_else(|| {
                Error::InvalidArgument(format!("slot {i} has no host mapping"))
            })?;
            let (offset, len) = byte_range(slot, plane)?;
            self.runtime
                .cache_sync(op, slot.data_ptr().offset(offset), mapped.offset(offset), len)
                .inspect_err(|e| error!(?op, slot = i, error = %e, "cache sync failed"))?;
        }
        Ok(())
    }

    /// Fill slots or planes with `value`.
    ///
    /// Host kinds are filled by the CPU, every other kind by the device.
    /// `Select::All` as the plane fills the whole slot, planeless slots
    /// included.
    pub fn memset(
        &self,
        surface: &mut Surface,
        index: Select,
        plane: Select,
        value: u8,
    ) -> Result<()> {
        let mem_type = surface.mem_type();
        let span = observability::span_surface("memset", mem_type, surface.batch_size());
        let _guard = span.enter();

        let slots = index.range(surface.batch_size())?;
        if let Select::Index(p) = plane {
            let num_planes = slot_at(surface, 0)?.plane_params().num_planes();
            if p >= num_planes {
                error!(plane = p, num_planes, "plane out of range");
                return Err(Error::InvalidArgument(format!(
                    "plane {p} is out of range 0..{num_planes}"
                )));
            }
        }

        if !mem_type.is_host() {
            self.runtime.set_device(surface.device_id())?;
        }
        for i in slots {
            let slot = *slot_at(surface, i)?;
            let (offset, len) = byte_range(&slot, plane)?;

            if mem_type.is_host() {
                let bytes = surface
                    .host_slot_mut(i)
                    .and_then(|b| b.get_mut(offset..offset + len))
                    .ok_or_else(|| Error::InvalidArgument(format!("slot {i} is not host visible")))?;
                bytes.fill(value);
                continue;
            }

            // SAFETY: `surface` is borrowed mutably, so no Rust reference to
            // its host mapping is alive.
            unsafe {
                self.runtime
                    .memset_device(slot.data_ptr().offset(offset), value, len)
            }
            .inspect_err(|e| error!(slot = i, error = %e, "device fill failed"))?;

            if mem_type.is_cached() {
                if let Some(mapped) = slot.mapped_ptr() {
                    self.runtime.cache_sync(
                        CacheOp::Invalidate,
                        slot.data_ptr().offset(offset),
                        mapped.offset(offset),
                        len,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Copy every slot of `src` into `dst`.
    ///
    /// Slots of equal size are copied in one transfer. Otherwise planes are
    /// copied row by row, each side stepping by its own pitch, which lets
    /// surfaces with different padding exchange frames. The presentation
    /// timestamp is carried over and a cached destination is invalidated
    /// afterwards.
    pub fn copy(&self, src: &Surface, dst: &mut Surface) -> Result<()> {
        let span = observability::span_surface("copy", src.mem_type(), src.batch_size());
        let _guard = span.enter();

        if src.batch_size() != dst.batch_size() {
            error!(
                src = src.batch_size(),
                dst = dst.batch_size(),
                "batch size mismatch"
            );
            return Err(Error::IncompatibleOperands(format!(
                "batch sizes differ: {} vs {}",
                src.batch_size(),
                dst.batch_size()
            )));
        }

        let src_host = src.mem_type().is_host();
        let dst_host = dst.mem_type().is_host();
        if !src_host && !dst_host && src.device_id() != dst.device_id() {
            error!(
                src = src.device_id(),
                dst = dst.device_id(),
                "cross-device copy"
            );
            return Err(Error::IncompatibleOperands(format!(
                "surfaces live on devices {} and {}",
                src.device_id(),
                dst.device_id()
            )));
        }

        let direction = CopyDirection::between(src_host, dst_host);
        if !dst_host {
            self.runtime.set_device(dst.device_id())?;
        } else if !src_host {
            self.runtime.set_device(src.device_id())?;
        }

        for i in 0..src.batch_size() {
            let s = *slot_at(src, i)?;
            let d = *slot_at(dst, i)?;
            if s.data_size() == d.data_size() {
                // SAFETY: `dst` is borrowed mutably and `src` shared, so the
                // destination range is not aliased by any Rust reference.
                unsafe {
                    self.runtime.memcpy(
                        d.data_ptr(),
                        s.data_ptr(),
                        s.data_size() as usize,
                        direction,
                    )
                }
                .inspect_err(|e| error!(slot = i, error = %e, "slot copy failed"))?;
            } else {
                self.copy_planes(&s, &d, direction)
                    .inspect_err(|e| error!(slot = i, error = %e, "plane copy failed"))?;
            }
        }

        dst.set_pts(src.pts());
        observability::record_copy(src.mem_type(), dst.mem_type());

        if dst.mem_type().is_cached() {
            self.sync_for_cpu(dst, Select::All, Select::All)?;
        }
        Ok(())
    }

    fn copy_planes(&self, src: &SlotParams, dst: &SlotParams, direction: CopyDirection) -> Result<()> {
        let src_planes = src.plane_params().planes();
        let dst_planes = dst.plane_params().planes();
        if src_planes.is_empty() || src_planes.len() != dst_planes.len() {
            return Err(Error::IncompatibleOperands(format!(
                "slot sizes differ ({} vs {}) and plane layouts cannot be matched",
                src.data_size(),
                dst.data_size()
            )));
        }

        for (p, (sp, dp)) in src_planes.iter().zip(dst_planes).enumerate() {
            check_plane_pair(p, sp, dp)?;
            let row = sp.row_bytes();
            for r in 0..sp.height as usize {
                let from = plane_row(src.data_ptr(), sp, r);
                let to = plane_row(dst.data_ptr(), dp, r);
                // SAFETY: the row lies inside the destination plane, which the
                // caller's exclusive borrow of the destination covers.
                unsafe { self.runtime.memcpy(to, from, row, direction) }?;
            }
        }
        Ok(())
    }
}

fn slot_at(surface: &Surface, index: u32) -> Result<&SlotParams> {
    surface
        .slot(index)
        .ok_or_else(|| Error::InvalidArgument(format!("slot {index} does not exist")))
}

/// Byte range of `plane` within a slot; `All` is the whole slot.
pub(crate) fn byte_range(slot: &SlotParams, plane: Select) -> Result<(usize, usize)> {
    match plane {
        Select::All => Ok((0, slot.data_size() as usize)),
        Select::Index(p) => slot
            .plane_params()
            .plane(p as usize)
            .map(|info| (info.offset as usize, info.psize as usize))
            .ok_or_else(|| Error::InvalidArgument(format!("plane {p} does not exist"))),
    }
}

fn check_plane_pair(index: usize, src: &PlaneInfo, dst: &PlaneInfo) -> Result<()> {
    if index > 0 && (src.offset == 0 || dst.offset == 0) {
        return Err(Error::IncompatibleOperands(format!(
            "plane {index} has a zero offset"
        )));
    }
    let row = src.row_bytes();
    if row == 0 || src.pitch == 0 || dst.pitch == 0 {
        return Err(Error::IncompatibleOperands(format!(
            "plane {index} has an empty row or pitch"
        )));
    }
    if dst.row_bytes() < row || dst.height < src.height {
        return Err(Error::IncompatibleOperands(format!(
            "plane {index} is {}x{} in the source but {}x{} in the destination",
            src.width, src.height, dst.width, dst.height
        )));
    }
    Ok(())
}

#[inline]
fn plane_row(base: Addr, plane: &PlaneInfo, row: usize) -> Addr {
    base.offset(plane.offset as usize + row * plane.pitch as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::ColorFormat;
    use crate::platform::{SimulatedConfig, SimulatedRuntime};

    fn context(config: SimulatedConfig) -> (Arc<SimulatedRuntime>, BufSurfaceContext) {
        let sim = Arc::new(SimulatedRuntime::new(config));
        let ctx = BufSurfaceContext::new(sim.clone());
        (sim, ctx)
    }

    fn read_slot(sim: &SimulatedRuntime, surface: &Surface, index: u32) -> Vec<u8> {
        match surface.host_slot(index) {
            Some(bytes) => bytes.to_vec(),
            None => {
                let slot = surface.slot(index).unwrap();
                sim.read_device(slot.data_ptr(), slot.data_size() as usize)
                    .unwrap()
            }
        }
    }

    #[test]
    fn test_create_resolves_default() {
        let (_, ctx) = context(SimulatedConfig::discrete());
        let surf = ctx
            .create(&CreateParams::frame(MemType::Default, 64, 64, ColorFormat::Rgba))
            .unwrap();
        assert_eq!(surf.mem_type(), MemType::Device);
        assert!(surf.pool().is_none());
    }

    #[test]
    fn test_one_shot_vb_rejected() {
        let (_, ctx) = context(SimulatedConfig::unified());
        let params = CreateParams::sized(MemType::Vb, 4096);
        assert!(matches!(
            ctx.create(&params),
            Err(Error::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_one_shot_memory_released_on_destroy() {
        let (sim, ctx) = context(SimulatedConfig::discrete());
        let surf = ctx
            .create(&CreateParams::sized(MemType::Device, 4096).with_batch_size(2))
            .unwrap();
        assert_eq!(sim.live_allocations(), 1);
        ctx.destroy(surf).unwrap();
        assert_eq!(sim.live_allocations(), 0);
        assert_eq!(ctx.arena_stats().available, 1);
    }

    #[test]
    fn test_sync_rejects_uncached_kinds() {
        let (_, ctx) = context(SimulatedConfig::unified());
        let surf = ctx.create(&CreateParams::sized(MemType::Device, 64)).unwrap();
        assert!(ctx.sync_for_cpu(&surf, Select::All, Select::All).is_err());
        let surf = ctx.create(&CreateParams::sized(MemType::Unified, 64)).unwrap();
        assert!(ctx.sync_for_device(&surf, Select::All, Select::All).is_err());
    }

    #[test]
    fn test_sync_cached_counts_per_slot() {
        let (sim, ctx) = context(SimulatedConfig::unified());
        let surf = ctx
            .create(&CreateParams::sized(MemType::UnifiedCached, 256).with_batch_size(3))
            .unwrap();
        ctx.sync_for_device(&surf, Select::All, Select::All).unwrap();
        assert_eq!(sim.cache_ops(CacheOp::Flush), 3);
        ctx.sync_for_cpu(&surf, Select::Index(1), Select::All).unwrap();
        assert_eq!(sim.cache_ops(CacheOp::Invalidate), 1);
        assert!(ctx.sync_for_cpu(&surf, Select::Index(3), Select::All).is_err());
    }

    #[test]
    fn test_memset_scoped_to_slot_and_plane() {
        let (_, ctx) = context(SimulatedConfig::unified());
        let params = CreateParams::frame(MemType::System, 16, 8, ColorFormat::Nv12).with_batch_size(2);
        let mut surf = ctx.create(&params).unwrap();
        ctx.memset(&mut surf, Select::Index(1), Select::Index(1), 0x80).unwrap();

        let layout = *surf.slot(1).unwrap().plane_params();
        let uv = layout.plane(1).unwrap();
        let slot0 = surf.host_slot(0).unwrap();
        assert!(slot0.iter().all(|&b| b == 0));
        let slot1 = surf.host_slot(1).unwrap();
        assert!(slot1[..uv.offset as usize].iter().all(|&b| b == 0));
        assert!(slot1[uv.offset as usize..].iter().all(|&b| b == 0x80));
    }

    #[test]
    fn test_memset_bounds() {
        let (_, ctx) = context(SimulatedConfig::unified());
        let mut surf = ctx
            .create(&CreateParams::frame(MemType::System, 16, 8, ColorFormat::Rgba))
            .unwrap();
        assert!(ctx.memset(&mut surf, Select::Index(1), Select::All, 1).is_err());
        assert!(ctx.memset(&mut surf, Select::All, Select::Index(1), 1).is_err());
        ctx.memset(&mut surf, Select::All, Select::Index(0), 1).unwrap();
    }

    #[test]
    fn test_memset_planeless_fills_slot() {
        let (sim, ctx) = context(SimulatedConfig::discrete());
        let mut surf = ctx.create(&CreateParams::sized(MemType::Device, 100)).unwrap();
        ctx.memset(&mut surf, Select::All, Select::All, 0xab).unwrap();
        assert!(read_slot(&sim, &surf, 0).iter().all(|&b| b == 0xab));
        assert_eq!(sim.device_fills(), 1);
        assert!(ctx.memset(&mut surf, Select::All, Select::Index(0), 0).is_err());
    }

    #[test]
    fn test_memset_cached_invalidates() {
        let (sim, ctx) = context(SimulatedConfig::unified());
        let mut surf = ctx.create(&CreateParams::sized(MemType::UnifiedCached, 64)).unwrap();
        ctx.memset(&mut surf, Select::All, Select::All, 7).unwrap();
        assert_eq!(sim.cache_ops(CacheOp::Invalidate), 1);
        assert!(surf.host_slot(0).unwrap().iter().all(|&b| b == 7));
    }

    #[test]
    fn test_copy_system_to_device_and_back() {
        let (sim, ctx) = context(SimulatedConfig::discrete());
        let params = CreateParams::sized(MemType::System, 512).with_batch_size(2);
        let mut host = ctx.create(&params).unwrap();
        for (i, b) in host.host_slot_mut(1).unwrap().iter_mut().enumerate() {
            *b = i as u8;
        }
        host.set_pts(42);

        let mut dev = ctx
            .create(&CreateParams::sized(MemType::Device, 512).with_batch_size(2))
            .unwrap();
        ctx.copy(&host, &mut dev).unwrap();
        assert_eq!(dev.pts(), 42);

        let mut back = ctx.create(&params).unwrap();
        ctx.copy(&dev, &mut back).unwrap();
        assert_eq!(back.host_slot(1), host.host_slot(1));
        assert_eq!(read_slot(&sim, &dev, 1), host.host_slot(1).unwrap());
    }

    #[test]
    fn test_copy_across_pitches() {
        let (sim, ctx) = context(SimulatedConfig::discrete());
        let host_params = CreateParams::frame(MemType::System, 100, 30, ColorFormat::Nv12);
        let dev_params = CreateParams::frame(MemType::Device, 100, 30, ColorFormat::Nv12);
        let mut host = ctx.create(&host_params).unwrap();
        let mut dev = ctx.create(&dev_params).unwrap();
        assert_ne!(host.slot(0).unwrap().data_size(), dev.slot(0).unwrap().data_size());

        let layout = *host.slot(0).unwrap().plane_params();
        for plane in layout.planes() {
            let bytes = host.host_slot_mut(0).unwrap();
            for r in 0..plane.height as usize {
                let start = plane.offset as usize + r * plane.pitch as usize;
                bytes[start..start + plane.row_bytes()].fill(r as u8 + 1);
            }
        }
        ctx.copy(&host, &mut dev).unwrap();

        let dev_slot = *dev.slot(0).unwrap();
        let dev_bytes = read_slot(&sim, &dev, 0);
        for (sp, dp) in layout.planes().iter().zip(dev_slot.plane_params().planes()) {
            for r in 0..sp.height as usize {
                let s = sp.offset as usize + r * sp.pitch as usize;
                let d = dp.offset as usize + r * dp.pitch as usize;
                assert_eq!(
                    &dev_bytes[d..d + sp.row_bytes()],
                    &host.host_slot(0).unwrap()[s..s + sp.row_bytes()]
                );
            }
        }
    }

    #[test]
    fn test_copy_rejects_mismatched_operands() {
        let (_, ctx) = context(SimulatedConfig::discrete().with_device_count(2));
        let a = ctx.create(&CreateParams::sized(MemType::Device, 64)).unwrap();
        let mut b = ctx
            .create(&CreateParams::sized(MemType::Device, 64).with_device(1))
            .unwrap();
        assert!(matches!(ctx.copy(&a, &mut b), Err(Error::IncompatibleOperands(_))));

        let mut c = ctx
            .create(&CreateParams::sized(MemType::Device, 64).with_batch_size(2))
            .unwrap();
        assert!(matches!(ctx.copy(&a, &mut c), Err(Error::IncompatibleOperands(_))));

        let mut d = ctx.create(&CreateParams::sized(MemType::Device, 128)).unwrap();
        assert!(matches!(ctx.copy(&a, &mut d), Err(Error::IncompatibleOperands(_))));
    }

    #[test]
    fn test_copy_into_cached_invalidates() {
        let (sim, ctx) = context(SimulatedConfig::unified());
        let src = ctx.create(&CreateParams::sized(MemType::System, 64).with_batch_size(2)).unwrap();
        let mut dst = ctx
            .create(&CreateParams::sized(MemType::UnifiedCached, 64).with_batch_size(2))
            .unwrap();
        ctx.copy(&src, &mut dst).unwrap();
        assert_eq!(sim.cache_ops(CacheOp::Invalidate), 2);
    }
}
