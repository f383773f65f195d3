// gpu/memory.rs — Single-owner device handles.
//
// Every buffer and texture the crate allocates is wrapped in a
// `DeviceHandle`. The handle is the only owner of the native resource:
// it is not `Clone`, and dropping it releases the resource exactly once.
// Moving a handle moves ownership, so a resource can never be released
// twice or outlive its last owner.
//
// A process-wide counter tracks how many handles are alive. It exists for
// leak auditing (tests assert it returns to its baseline); nothing makes
// decisions based on it.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

static LIVE_HANDLES: AtomicUsize = AtomicUsize::new(0);

/// Number of device handles currently alive in this process.
pub fn live_handles() -> usize {
    LIVE_HANDLES.load(Ordering::Relaxed)
}

/// A native resource that can be released eagerly.
pub trait NativeResource {
    fn release(&self);
}

impl NativeResource for wgpu::Buffer {
    fn release(&self) {
        self.destroy();
    }
}

impl NativeResource for wgpu::Texture {
    fn release(&self) {
        self.destroy();
    }
}

/// What a handle holds, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeDescriptor {
    Bytes(u64),
    Texels { width: u32, height: u32, depth: u32 },
}

impl fmt::Display for SizeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizeDescriptor::Bytes(n) => write!(f, "{n} bytes"),
            SizeDescriptor::Texels { width, height, depth } => {
                write!(f, "{width}×{height}×{depth} texels")
            }
        }
    }
}

/// Sole owner of one native resource.
pub struct DeviceHandle<R: NativeResource> {
    resource: R,
    label: String,
    size: SizeDescriptor,
}

impl<R: NativeResource> DeviceHandle<R> {
    pub fn new(resource: R, label: impl Into<String>, size: SizeDescriptor) -> Self {
        let label = label.into();
        let live = LIVE_HANDLES.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::trace!(label = %label, size = %size, live, "device handle created");
        DeviceHandle { resource, label, size }
    }

    pub fn get(&self) -> &R {
        &self.resource
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn size(&self) -> SizeDescriptor {
        self.size
    }
}

impl<R: NativeResource> Drop for DeviceHandle<R> {
    fn drop(&mut self) {
        self.resource.release();
        let live = LIVE_HANDLES.fetch_sub(1, Ordering::Relaxed) - 1;
        tracing::trace!(label = %self.label, live, "device handle released");
    }
}

impl<R: NativeResource> fmt::Debug for DeviceHandle<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("label", &self.label)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Counted(Rc<Cell<u32>>);

    impl NativeResource for Counted {
        fn release(&self) {
            self.0.set(self.0.get() + 1);
        }
    }

    // The only non-GPU test that creates handles, so the global counter
    // delta is not disturbed by parallel tests.
    #[test]
    fn test_handle_releases_exactly_once() {
        let released = Rc::new(Cell::new(0));
        let baseline = live_handles();

        let a = DeviceHandle::new(Counted(released.clone()), "a", SizeDescriptor::Bytes(16));
        let b = DeviceHandle::new(
            Counted(released.clone()),
            "b",
            SizeDescriptor::Texels { width: 2, height: 2, depth: 2 },
        );
        assert_eq!(live_handles(), baseline + 2);
        assert_eq!(a.label(), "a");
        assert_eq!(b.size().to_string(), "2×2×2 texels");

        // Moving transfers ownership without releasing.
        let moved = a;
        assert_eq!(released.get(), 0);

        drop(moved);
        assert_eq!(released.get(), 1);
        assert_eq!(live_handles(), baseline + 1);

        drop(b);
        assert_eq!(released.get(), 2);
        assert_eq!(live_handles(), baseline);
    }
}
