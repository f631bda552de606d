//! Event surface for UI decoupling.
//!
//! Callers (GUI, CLI, file-operations manager) subscribe through
//! [`DeviceObserver`] instead of the core holding references back into UI
//! code. The observer handle is passed into the session explicitly.

use std::fmt;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Connected => write!(f, "Connected"),
        }
    }
}

/// USB packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx,
    Rx,
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted by a device session.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Connection state changed.
    ConnectionChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    /// The configured device was absent and another HiDock was used instead.
    /// UIs must surface this.
    DeviceSubstituted {
        requested: (u16, u16),
        connected: (u16, u16),
    },
    /// Progress of a streaming transfer.
    Progress {
        operation: String,
        current: u64,
        total: u64,
    },
    /// A frame crossed the bulk pipe.
    Packet {
        direction: PacketDirection,
        command: u16,
        length: usize,
    },
}

/// Observer trait for receiving session events.
pub trait DeviceObserver: Send + Sync {
    fn on_event(&self, event: &DeviceEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl DeviceObserver for NullObserver {
    fn on_event(&self, _event: &DeviceEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl DeviceObserver for TracingObserver {
    fn on_event(&self, event: &DeviceEvent) {
        match event {
            DeviceEvent::ConnectionChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "Connection state changed");
            }
            DeviceEvent::DeviceSubstituted {
                requested,
                connected,
            } => {
                tracing::warn!(
                    requested = %format!("{:04X}:{:04X}", requested.0, requested.1),
                    connected = %format!("{:04X}:{:04X}", connected.0, connected.1),
                    "Configured device absent, connected to another HiDock"
                );
            }
            DeviceEvent::Progress {
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 { current * 100 / total } else { 0 };
                tracing::debug!(operation = %operation, progress = %format!("{pct}%"), "Progress");
            }
            DeviceEvent::Packet {
                direction,
                command,
                length,
            } => {
                tracing::trace!(dir = %direction, command = command, len = length, "USB frame");
            }
        }
    }
}
