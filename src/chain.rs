use bytes::Bytes;

/// One decoded protocol object, as produced by the upstream packet decoder.
///
/// A chain carries the objects of one captured packet, outermost decode
/// result first; walking the chain forward visits what the decoder saw as
/// the `prev` links. The dispatcher only consumes `Payload` and the
/// destination address of `Ip`/`Ip6`; everything else is walked past.
#[derive(Debug, Clone)]
pub enum PacketObject {
    Ip { src: [u8; 4], dst: [u8; 4] },
    Ip6 { src: [u8; 16], dst: [u8; 16] },
    Udp { src_port: u16, dst_port: u16 },
    Dns,
    Payload(Bytes),
}

/// The object chain handed to [`crate::engine::Engine::receive`] for every
/// inbound packet.
#[derive(Debug, Clone, Default)]
pub struct ObjectChain {
    objects: Vec<PacketObject>,
}

impl ObjectChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next object down the chain (builder style).
    pub fn with(mut self, obj: PacketObject) -> Self {
        self.objects.push(obj);
        self
    }

    /// First payload object walking from the chain head, as its position
    /// plus the bytes. Cloning `Bytes` only bumps a refcount, so the
    /// payload outlives the chain without copying.
    pub fn payload(&self) -> Option<(usize, Bytes)> {
        self.objects.iter().enumerate().find_map(|(at, o)| match o {
            PacketObject::Payload(b) => Some((at, b.clone())),
            _ => None,
        })
    }

    /// Client key from the first IP/IP6 object at or past `start`: the
    /// leading 4 bytes of the destination address in network byte order.
    ///
    /// 找不到 IP/IP6 对象时返回 None，由调用方计入 discarded
    /// `None` when no address object exists; the caller counts the discard.
    pub fn client_key_from(&self, start: usize) -> Option<u32> {
        self.objects[start..].iter().find_map(|o| match o {
            PacketObject::Ip { dst, .. } => Some(u32::from_be_bytes(*dst)),
            PacketObject::Ip6 { dst, .. } => {
                Some(u32::from_be_bytes([dst[0], dst[1], dst[2], dst[3]]))
            }
            _ => None,
        })
    }

    /// Drop every object except the payload at `keep`. Called by the
    /// dispatcher when the engine owns chain recycling (`free_after_use`).
    pub fn recycle_except(&mut self, keep: usize) {
        let payload = match self.objects.get(keep) {
            Some(PacketObject::Payload(b)) => PacketObject::Payload(b.clone()),
            _ => return,
        };
        self.objects.clear();
        self.objects.push(payload);
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
