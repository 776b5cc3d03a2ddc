use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::Display;

/// Number of ADC channels exposed by the fixture firmware.
pub const CHANNEL_COUNT: usize = 19;

/// Index into the channel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u8);

impl ChannelId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Iterate over every channel id in table order
    pub fn all() -> impl Iterator<Item = ChannelId> {
        (0..CHANNEL_COUNT as u8).map(ChannelId)
    }

    pub fn channel(self) -> Option<&'static Channel> {
        CHANNELS.get(self.index())
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two boards the channel table is split across.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ChannelGroup {
    #[strum(to_string = "power board")]
    Power,
    #[strum(to_string = "peripheral board")]
    Peripheral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    /// Request token written to the wire
    pub command: &'static str,
    /// Lower-case name the firmware prints in front of the reading
    pub response_name: &'static str,
    pub display_name: &'static str,
    pub group: ChannelGroup,
}

const fn ch(
    id: u8,
    command: &'static str,
    response_name: &'static str,
    display_name: &'static str,
    group: ChannelGroup,
) -> Channel {
    Channel {
        id: ChannelId(id),
        command,
        response_name,
        display_name,
        group,
    }
}

#[rustfmt::skip]
pub static CHANNELS: [Channel; CHANNEL_COUNT] = [
    ch(0,  "RD00", "vin",         "Input supply",      ChannelGroup::Power),
    ch(1,  "RD01", "v5_main",     "5V main rail",      ChannelGroup::Power),
    ch(2,  "RD02", "v3v3_main",   "3.3V main rail",    ChannelGroup::Power),
    ch(3,  "RD03", "v1v8_core",   "1.8V core rail",    ChannelGroup::Power),
    ch(4,  "RD04", "v1v2_core",   "1.2V core rail",    ChannelGroup::Power),
    ch(5,  "RD05", "vref",        "ADC reference",     ChannelGroup::Power),
    ch(6,  "RD06", "v12_aux",     "12V auxiliary",     ChannelGroup::Power),
    ch(7,  "RD07", "v5_usb",      "5V USB",            ChannelGroup::Power),
    ch(8,  "RD08", "v3v3_io",     "3.3V I/O rail",     ChannelGroup::Power),
    ch(9,  "RD09", "v2v5_ddr",    "2.5V DDR rail",     ChannelGroup::Power),
    ch(10, "RD10", "v1v5_ddr",    "1.5V DDR rail",     ChannelGroup::Power),
    ch(11, "RD11", "vtt_ddr",     "DDR termination",   ChannelGroup::Power),
    ch(12, "RD12", "v3v3_rf",     "3.3V RF rail",      ChannelGroup::Peripheral),
    ch(13, "RD13", "v1v8_rf",     "1.8V RF rail",      ChannelGroup::Peripheral),
    ch(14, "RD14", "vbat",        "Backup battery",    ChannelGroup::Peripheral),
    ch(15, "RD15", "v5_sensor",   "5V sensor rail",    ChannelGroup::Peripheral),
    ch(16, "RD16", "v3v3_sensor", "3.3V sensor rail",  ChannelGroup::Peripheral),
    ch(17, "RD17", "v1v8_sensor", "1.8V sensor rail",  ChannelGroup::Peripheral),
    ch(18, "RD18", "vpp",         "Programming rail",  ChannelGroup::Peripheral),
];

/// Look up a channel by the name the firmware prints, ignoring case
pub fn channel_by_response_name(name: &str) -> Option<&'static Channel> {
    let name = name.to_ascii_lowercase();
    CHANNELS.iter().find(|c| c.response_name == name)
}

pub fn channel_by_command(command: &str) -> Option<&'static Channel> {
    CHANNELS.iter().find(|c| c.command == command)
}
