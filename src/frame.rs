// ABOUTME: Wire-format DTOs for the discovery and encode-request protocols
// ABOUTME: Kept separate from the domain types in types.rs, the way encode_server_description.h sits apart from image.h

use crate::error::NetworkError;
use crate::socket::Socket;
use crate::types::{ColourRange, Eye, PixelFormat};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EyeXml {
    Both,
    Left,
    Right,
}

impl From<Eye> for EyeXml {
    fn from(eye: Eye) -> Self {
        match eye {
            Eye::Both => EyeXml::Both,
            Eye::Left => EyeXml::Left,
            Eye::Right => EyeXml::Right,
        }
    }
}

impl From<EyeXml> for Eye {
    fn from(eye: EyeXml) -> Self {
        match eye {
            EyeXml::Both => Eye::Both,
            EyeXml::Left => Eye::Left,
            EyeXml::Right => Eye::Right,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormatXml {
    Rgb24,
    Bgra,
    Yuv420p,
}

impl From<PixelFormat> for PixelFormatXml {
    fn from(f: PixelFormat) -> Self {
        match f {
            PixelFormat::Rgb24 => PixelFormatXml::Rgb24,
            PixelFormat::Bgra => PixelFormatXml::Bgra,
            PixelFormat::Yuv420P => PixelFormatXml::Yuv420p,
        }
    }
}

impl From<PixelFormatXml> for PixelFormat {
    fn from(f: PixelFormatXml) -> Self {
        match f {
            PixelFormatXml::Rgb24 => PixelFormat::Rgb24,
            PixelFormatXml::Bgra => PixelFormat::Bgra,
            PixelFormatXml::Yuv420p => PixelFormat::Yuv420P,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColourRangeXml {
    Full,
    Video,
}

impl From<ColourRange> for ColourRangeXml {
    fn from(r: ColourRange) -> Self {
        match r {
            ColourRange::Full => ColourRangeXml::Full,
            ColourRange::Video => ColourRangeXml::Video,
        }
    }
}

impl From<ColourRangeXml> for ColourRange {
    fn from(r: ColourRangeXml) -> Self {
        match r {
            ColourRangeXml::Full => ColourRange::Full,
            ColourRangeXml::Video => ColourRange::Video,
        }
    }
}

/// The XML header a remote worker reads before the raw pixel buffer that
/// follows it on the same connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "EncodingRequest")]
pub struct EncodingRequestXml {
    pub frame_index: u64,
    pub eye: EyeXml,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormatXml,
    pub colour_range: ColourRangeXml,
    /// Compared against the remote's own link version; a mismatch is a
    /// protocol error rather than something either side can silently ignore.
    #[serde(rename = "Version")]
    pub server_link_version: i32,
}

/// Reply to a discovery hello, sent to both the main and batch presence
/// ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename = "ServerAvailable")]
pub struct ServerAvailableXml {
    #[serde(rename = "Version")]
    pub link_version: i32,
    #[serde(rename = "Threads")]
    pub threads: usize,
}

fn to_xml<T: Serialize>(value: &T) -> Result<String, NetworkError> {
    quick_xml::se::to_string(value).map_err(|e| NetworkError::Other(e.to_string()))
}

fn from_xml<T: for<'de> Deserialize<'de>>(xml: &str) -> Result<T, NetworkError> {
    quick_xml::de::from_str(xml).map_err(|e| NetworkError::Other(e.to_string()))
}

impl EncodingRequestXml {
    pub fn to_xml(&self) -> Result<String, NetworkError> {
        to_xml(self)
    }

    pub fn from_xml(xml: &str) -> Result<Self, NetworkError> {
        from_xml(xml)
    }
}

impl ServerAvailableXml {
    pub fn to_xml(&self) -> Result<String, NetworkError> {
        to_xml(self)
    }

    pub fn from_xml(xml: &str) -> Result<Self, NetworkError> {
        from_xml(xml)
    }
}

/// Write a `ServerAvailable` reply using the single length-prefixed frame
/// that a correct client expects.
pub async fn write_server_available(
    socket: &mut Socket,
    reply: &ServerAvailableXml,
) -> Result<(), NetworkError> {
    let xml = reply.to_xml()?;
    socket.write_framed(xml.as_bytes()).await
}

/// Write a `ServerAvailable` reply the way the original broadcast path does:
/// the frame is written twice on the same connection. Upstream clients
/// tolerate it by reading one frame and ignoring the socket close that
/// follows, but nothing here should originate it by default; it exists only
/// so a client written against the legacy behaviour can still be exercised.
pub async fn write_server_available_legacy(
    socket: &mut Socket,
    reply: &ServerAvailableXml,
) -> Result<(), NetworkError> {
    let xml = reply.to_xml()?;
    socket.write_framed(xml.as_bytes()).await?;
    socket.write_framed(xml.as_bytes()).await
}

pub async fn read_server_available(socket: &mut Socket) -> Result<ServerAvailableXml, NetworkError> {
    let bytes = socket
        .read_framed(crate::socket::MAX_HEADER_SIZE)
        .await?;
    let xml = String::from_utf8(bytes).map_err(|e| NetworkError::Other(e.to_string()))?;
    ServerAvailableXml::from_xml(&xml)
}

pub async fn write_encoding_request(
    socket: &mut Socket,
    request: &EncodingRequestXml,
) -> Result<(), NetworkError> {
    let xml = request.to_xml()?;
    socket.write_framed(xml.as_bytes()).await
}

pub async fn read_encoding_request(
    socket: &mut Socket,
) -> Result<EncodingRequestXml, NetworkError> {
    let bytes = socket
        .read_framed(crate::socket::MAX_HEADER_SIZE)
        .await?;
    let xml = String::from_utf8(bytes).map_err(|e| NetworkError::Other(e.to_string()))?;
    EncodingRequestXml::from_xml(&xml)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_request_round_trips_through_xml() {
        let request = EncodingRequestXml {
            frame_index: 42,
            eye: EyeXml::Left,
            width: 1998,
            height: 1080,
            pixel_format: PixelFormatXml::Rgb24,
            colour_range: ColourRangeXml::Full,
            server_link_version: 2,
        };

        let xml = request.to_xml().unwrap();
        let parsed = EncodingRequestXml::from_xml(&xml).unwrap();
        assert_eq!(request, parsed);
    }

    #[test]
    fn server_available_round_trips_through_xml() {
        let reply = ServerAvailableXml {
            link_version: 2,
            threads: 4,
        };

        let xml = reply.to_xml().unwrap();
        let parsed = ServerAvailableXml::from_xml(&xml).unwrap();
        assert_eq!(reply, parsed);
    }
}
