use log::warn;

/// A device model reachable through port I/O. Word and dword accesses
/// decompose into byte accesses unless the device overrides them.
pub trait IoDevice {
    fn port_in8(&mut self, port: u16) -> u8;
    fn port_out8(&mut self, port: u16, value: u8);

    fn port_in16(&mut self, port: u16) -> u16 {
        let lo = self.port_in8(port) as u16;
        let hi = self.port_in8(port.wrapping_add(1)) as u16;
        lo | (hi << 8)
    }

    fn port_out16(&mut self, port: u16, value: u16) {
        self.port_out8(port, value as u8);
        self.port_out8(port.wrapping_add(1), (value >> 8) as u8);
    }

    fn port_in32(&mut self, port: u16) -> u32 {
        let lo = self.port_in16(port) as u32;
        let hi = self.port_in16(port.wrapping_add(2)) as u32;
        lo | (hi << 16)
    }

    fn port_out32(&mut self, port: u16, value: u32) {
        self.port_out16(port, value as u16);
        self.port_out16(port.wrapping_add(2), (value >> 16) as u16);
    }

    fn name(&self) -> &'static str;
}

struct PortMapping {
    start: u16,
    end: u16,
    device_idx: usize,
}

/// Port-range dispatch to registered devices. Unknown ports read as 0xFF
/// and drop writes with a warning, so guests keep running.
pub struct IoBus {
    devices: Vec<Box<dyn IoDevice>>,
    mappings: Vec<PortMapping>,
}

impl IoBus {
    pub fn new() -> Self {
        Self {
            devices: Vec::new(),
            mappings: Vec::new(),
        }
    }

    /// Register a device over the inclusive port range [start, end].
    pub fn register(&mut self, start: u16, end: u16, device: Box<dyn IoDevice>) {
        let idx = self.devices.len();
        self.devices.push(device);
        self.mappings.push(PortMapping {
            start,
            end,
            device_idx: idx,
        });
    }

    fn device_for(&mut self, port: u16) -> Option<&mut Box<dyn IoDevice>> {
        let idx = self
            .mappings
            .iter()
            .find(|m| port >= m.start && port <= m.end)?
            .device_idx;
        Some(&mut self.devices[idx])
    }

    pub fn port_in8(&mut self, port: u16) -> u8 {
        match self.device_for(port) {
            Some(device) => device.port_in8(port),
            None => 0xFF,
        }
    }

    pub fn port_in16(&mut self, port: u16) -> u16 {
        match self.device_for(port) {
            Some(device) => device.port_in16(port),
            None => 0xFFFF,
        }
    }

    pub fn port_in32(&mut self, port: u16) -> u32 {
        match self.device_for(port) {
            Some(device) => device.port_in32(port),
            None => 0xFFFF_FFFF,
        }
    }

    pub fn port_out8(&mut self, port: u16, value: u8) {
        match self.device_for(port) {
            Some(device) => device.port_out8(port, value),
            None => warn!("[io] write {value:#04x} to unmapped port {port:#06x}"),
        }
    }

    pub fn port_out16(&mut self, port: u16, value: u16) {
        match self.device_for(port) {
            Some(device) => device.port_out16(port, value),
            None => warn!("[io] write {value:#06x} to unmapped port {port:#06x}"),
        }
    }

    pub fn port_out32(&mut self, port: u16, value: u32) {
        match self.device_for(port) {
            Some(device) => device.port_out32(port, value),
            None => warn!("[io] write {value:#010x} to unmapped port {port:#06x}"),
        }
    }
}

impl Default for IoBus {
    fn default() -> Self {
        Self::new()
    }
}
