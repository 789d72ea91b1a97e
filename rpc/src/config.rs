//! transport configuration.
//!
//! options can be set programmatically through the builder or parsed
//! from the `key=value,key=value` init-string format that collaborators
//! pass down from their own command lines.

use crate::packet::HEADER_LEN;

/// configuration for one distributed-control instance.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// select the ring-backed stream sender (`true`) or the queue-backed
    /// write-combining sender (`false`).
    pub buffered_send: bool,

    /// ring capacity for the stream sender, in bytes.
    /// must be a power of 2 and strictly exceed the largest packet.
    pub send_buffer_size: usize,

    /// inclusive framed-size cutoff below which the expqueue sender
    /// attempts write-combining.
    pub combine_lower_threshold: usize,

    /// capacity of the expqueue combining buffer.
    pub combine_upper_threshold: usize,

    /// socket option pass-through.
    pub tcp_nodelay: bool,

    /// sanity limit on a single payload; a decoded header claiming more
    /// is a protocol violation.
    pub max_packet_size: usize,

    /// kernel send/receive buffer size requested per socket.
    pub socket_buffer_size: usize,

    /// outbound connect attempts per peer before init fails.
    pub connect_retries: usize,

    /// delay between connect attempts, in milliseconds.
    pub connect_retry_delay_ms: u64,

    /// how long init waits for every peer to dial in, in milliseconds.
    pub init_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            buffered_send: false,
            send_buffer_size: 16 * 1024 * 1024, // power of 2
            combine_lower_threshold: 1024,
            combine_upper_threshold: 64 * 1024,
            tcp_nodelay: true,
            max_packet_size: 1024 * 1024, // 1MB
            socket_buffer_size: 1024 * 1024,
            connect_retries: 300,
            connect_retry_delay_ms: 100,
            init_timeout_ms: 30_000,
        }
    }
}

impl RpcConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffered_send(mut self, buffered: bool) -> Self {
        self.buffered_send = buffered;
        self
    }

    /// set the stream-sender ring capacity. must be a power of 2.
    pub fn with_send_buffer_size(mut self, size: usize) -> Self {
        assert!(
            size.is_power_of_two(),
            "send buffer size must be a power of 2, got {}",
            size
        );
        self.send_buffer_size = size;
        self
    }

    pub fn with_combine_thresholds(mut self, lower: usize, upper: usize) -> Self {
        self.combine_lower_threshold = lower;
        self.combine_upper_threshold = upper;
        self
    }

    pub fn with_tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.tcp_nodelay = nodelay;
        self
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size;
        self
    }

    pub fn with_connect_retries(mut self, retries: usize, delay_ms: u64) -> Self {
        self.connect_retries = retries;
        self.connect_retry_delay_ms = delay_ms;
        self
    }

    pub fn with_init_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.init_timeout_ms = timeout_ms;
        self
    }

    /// parse a `key=value` init-string, e.g.
    /// `"buffered_send=yes,send_buffer_size=1048576,tcp_nodelay=no"`.
    /// entries are separated by commas or whitespace; unknown keys and
    /// malformed values are errors.
    pub fn parse_initstring(initstring: &str) -> Result<Self, String> {
        let mut config = Self::default();

        for entry in initstring
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|s| !s.is_empty())
        {
            let (key, value) = entry
                .split_once('=')
                .ok_or_else(|| format!("malformed option '{}', expected key=value", entry))?;
            let (key, value) = (key.trim(), value.trim());

            match key {
                "buffered_send" => config.buffered_send = parse_yes_no(key, value)?,
                "send_buffer_size" => config.send_buffer_size = parse_bytes(key, value)?,
                "combine_lower_threshold" => {
                    config.combine_lower_threshold = parse_bytes(key, value)?
                }
                "combine_upper_threshold" => {
                    config.combine_upper_threshold = parse_bytes(key, value)?
                }
                "tcp_nodelay" => config.tcp_nodelay = parse_yes_no(key, value)?,
                "max_packet_size" => config.max_packet_size = parse_bytes(key, value)?,
                _ => return Err(format!("unknown option '{}'", key)),
            }
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !self.send_buffer_size.is_power_of_two() {
            return Err(format!(
                "send_buffer_size must be a power of 2, got {}",
                self.send_buffer_size
            ));
        }
        if self.max_packet_size == 0 {
            return Err("max_packet_size must be greater than 0".to_string());
        }
        // the header carries the payload length as a u32
        if self.max_packet_size > u32::MAX as usize {
            return Err(format!(
                "max_packet_size ({}) exceeds the wire format's u32 length field",
                self.max_packet_size
            ));
        }
        if self.combine_upper_threshold < self.combine_lower_threshold {
            return Err(format!(
                "combine_upper_threshold ({}) is below combine_lower_threshold ({})",
                self.combine_upper_threshold, self.combine_lower_threshold
            ));
        }
        if self.combine_upper_threshold < HEADER_LEN {
            return Err(format!(
                "combine_upper_threshold ({}) cannot hold a packet header",
                self.combine_upper_threshold
            ));
        }
        // the ring must fit the largest packet with room to spare,
        // otherwise a single oversized send_data would deadlock the writer
        if self.buffered_send && self.send_buffer_size <= HEADER_LEN + self.max_packet_size {
            return Err(format!(
                "send_buffer_size ({}) must strictly exceed header + max_packet_size ({})",
                self.send_buffer_size,
                HEADER_LEN + self.max_packet_size
            ));
        }
        if self.connect_retries == 0 {
            return Err("connect_retries must be greater than 0".to_string());
        }
        Ok(())
    }
}

fn parse_yes_no(key: &str, value: &str) -> Result<bool, String> {
    match value {
        "yes" => Ok(true),
        "no" => Ok(false),
        _ => Err(format!("option '{}' expects yes|no, got '{}'", key, value)),
    }
}

fn parse_bytes(key: &str, value: &str) -> Result<usize, String> {
    value
        .parse::<usize>()
        .map_err(|_| format!("option '{}' expects a byte count, got '{}'", key, value))
}
