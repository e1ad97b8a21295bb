use super::PipelineError;

use parking_lot::{Condvar, Mutex};
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

/// A fixed set of mutually-exclusive devices.
///
/// Each run leases one device for its whole duration. The lease returns the device to the pool
/// when dropped, so a device is released even if the run fails, times out or panics.
pub struct DevicePool<D> {
    idle: Mutex<Vec<D>>,
    returned: Condvar,
    size: usize,
}

pub struct DeviceLease<'p, D> {
    pool: &'p DevicePool<D>,
    device: Option<D>,
}

impl<D> DevicePool<D> {
    pub fn new(devices: Vec<D>) -> Result<Self, PipelineError> {
        if devices.is_empty() {
            return Err(PipelineError::ResourceExhausted(
                "device pool is empty".to_string(),
            ));
        }
        let size = devices.len();
        Ok(DevicePool {
            idle: Mutex::new(devices),
            returned: Condvar::new(),
            size,
        })
    }

    pub fn single(device: D) -> Self {
        DevicePool {
            idle: Mutex::new(vec![device]),
            returned: Condvar::new(),
            size: 1,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Block until a device is free and lease it.
    pub fn lease(&self) -> DeviceLease<'_, D> {
        let mut idle = self.idle.lock();
        loop {
            if let Some(device) = idle.pop() {
                return DeviceLease {
                    pool: self,
                    device: Some(device),
                };
            }
            self.returned.wait(&mut idle);
        }
    }

    /// Like [Self::lease], but gives up after `timeout`.
    pub fn lease_timeout(&self, timeout: Duration) -> Option<DeviceLease<'_, D>> {
        let deadline = Instant::now() + timeout;
        let mut idle = self.idle.lock();
        loop {
            if let Some(device) = idle.pop() {
                return Some(DeviceLease {
                    pool: self,
                    device: Some(device),
                });
            }
            if self.returned.wait_until(&mut idle, deadline).timed_out() {
                return None;
            }
        }
    }

    fn give_back(&self, device: D) {
        self.idle.lock().push(device);
        self.returned.notify_one();
    }
}

impl<D> Deref for DeviceLease<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        self.device
            .as_ref()
            .unwrap_or_else(|| unreachable!("lease holds a device until dropped"))
    }
}

impl<D> DerefMut for DeviceLease<'_, D> {
    fn deref_mut(&mut self) -> &mut D {
        self.device
            .as_mut()
            .unwrap_or_else(|| unreachable!("lease holds a device until dropped"))
    }
}

impl<D> Drop for DeviceLease<'_, D> {
    fn drop(&mut self) {
        if let Some(device) = self.device.take() {
            self.pool.give_back(device);
        }
    }
}
