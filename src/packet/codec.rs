use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::packet::{ConnackPacket, ConnectFlags, ConnectPacket, ConnectReturnCode, ControlPacket, LastWill, PacketKind, PublishPacket, QoS, SubackPacket, SubscribePacket, UnsubscribePacket};
use crate::util::buf_ext::{BufExt, BufMutExt};

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL_3_1_1: u8 = 4;

/// fixed header flags mandated for PUBREL, SUBSCRIBE and UNSUBSCRIBE
const FLAGS_RESERVED_0010: u8 = 0b0010;

/// Reads exactly one packet from the stream. Packets with a body longer than
///  `max_packet_size` are rejected before their body is read.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R, max_packet_size: usize) -> anyhow::Result<ControlPacket> {
    let first_byte = reader.read_u8().await?;
    let remaining_len = read_remaining_len(reader).await?;
    if remaining_len > max_packet_size {
        bail!("incoming packet has a body of {} bytes, the configured maximum is {}", remaining_len, max_packet_size);
    }

    let mut body = vec![0u8; remaining_len];
    reader.read_exact(&mut body).await?;

    let packet = ControlPacket::deser(first_byte, Bytes::from(body))?;
    trace!("decoded {:?} packet", packet.kind());
    Ok(packet)
}

/// Writes a complete packet and flushes the stream
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &ControlPacket) -> anyhow::Result<()> {
    let mut buf = BytesMut::new();
    packet.ser(&mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_remaining_len<R: AsyncRead + Unpin>(reader: &mut R) -> anyhow::Result<usize> {
    let mut encoded = [0u8; 4];
    for i in 0..encoded.len() {
        encoded[i] = reader.read_u8().await?;
        if encoded[i] & 0x80 == 0 {
            let mut parse_buf = &encoded[..=i];
            return parse_buf.try_get_remaining_len();
        }
    }
    bail!("malformed remaining length: continuation bit set in fourth byte")
}

impl ControlPacket {
    pub fn ser(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        let mut body = BytesMut::new();
        let flags = self.ser_body(&mut body)?;

        buf.put_u8((u8::from(self.kind()) << 4) | flags);
        buf.put_remaining_len(body.len())?;
        buf.put_slice(&body);
        Ok(())
    }

    /// returns the flags nibble of the fixed header
    fn ser_body(&self, body: &mut BytesMut) -> anyhow::Result<u8> {
        match self {
            ControlPacket::Connect(connect) => {
                Self::ser_connect(connect, body)?;
                Ok(0)
            }
            ControlPacket::Connack(connack) => {
                body.put_u8(connack.session_present as u8);
                body.put_u8(connack.return_code.into());
                Ok(0)
            }
            ControlPacket::Publish(publish) => Self::ser_publish(publish, body),
            ControlPacket::Puback { message_id }
            | ControlPacket::Pubrec { message_id }
            | ControlPacket::Pubcomp { message_id }
            | ControlPacket::Unsuback { message_id } => {
                body.put_u16(*message_id);
                Ok(0)
            }
            ControlPacket::Pubrel { message_id } => {
                body.put_u16(*message_id);
                Ok(FLAGS_RESERVED_0010)
            }
            ControlPacket::Subscribe(subscribe) => {
                if subscribe.topics.is_empty() {
                    bail!("SUBSCRIBE requires at least one topic filter");
                }
                body.put_u16(subscribe.message_id);
                for (topic, qos) in &subscribe.topics {
                    body.put_mqtt_string(topic)?;
                    body.put_u8((*qos).into());
                }
                Ok(FLAGS_RESERVED_0010)
            }
            ControlPacket::Suback(suback) => {
                body.put_u16(suback.message_id);
                body.put_slice(&suback.return_codes);
                Ok(0)
            }
            ControlPacket::Unsubscribe(unsubscribe) => {
                if unsubscribe.topics.is_empty() {
                    bail!("UNSUBSCRIBE requires at least one topic filter");
                }
                body.put_u16(unsubscribe.message_id);
                for topic in &unsubscribe.topics {
                    body.put_mqtt_string(topic)?;
                }
                Ok(FLAGS_RESERVED_0010)
            }
            ControlPacket::Pingreq | ControlPacket::Pingresp | ControlPacket::Disconnect => Ok(0),
        }
    }

    fn ser_connect(connect: &ConnectPacket, body: &mut BytesMut) -> anyhow::Result<()> {
        let mut flags = ConnectFlags::empty();
        if connect.clean_session {
            flags |= ConnectFlags::CLEAN_SESSION;
        }
        if let Some(will) = &connect.will {
            flags |= ConnectFlags::WILL;
            flags |= ConnectFlags::from_bits_retain(u8::from(will.qos) << 3);
            if will.retain {
                flags |= ConnectFlags::WILL_RETAIN;
            }
        }
        if connect.username.is_some() {
            flags |= ConnectFlags::USERNAME;
        }
        if connect.password.is_some() {
            flags |= ConnectFlags::PASSWORD;
        }

        body.put_mqtt_string(PROTOCOL_NAME)?;
        body.put_u8(PROTOCOL_LEVEL_3_1_1);
        body.put_u8(flags.bits());
        body.put_u16(connect.keep_alive);

        body.put_mqtt_string(&connect.client_id)?;
        if let Some(will) = &connect.will {
            body.put_mqtt_string(&will.topic)?;
            body.put_mqtt_binary(&will.message)?;
        }
        if let Some(username) = &connect.username {
            body.put_mqtt_string(username)?;
        }
        if let Some(password) = &connect.password {
            body.put_mqtt_binary(password)?;
        }
        Ok(())
    }

    fn ser_publish(publish: &PublishPacket, body: &mut BytesMut) -> anyhow::Result<u8> {
        body.put_mqtt_string(&publish.topic)?;
        if publish.qos != QoS::AtMostOnce {
            if publish.message_id == 0 {
                bail!("QoS {:?} PUBLISH without a message identifier", publish.qos);
            }
            body.put_u16(publish.message_id);
        }
        body.put_slice(&publish.payload);

        Ok(((publish.dup as u8) << 3) | (u8::from(publish.qos) << 1) | publish.retain as u8)
    }

    pub fn deser(first_byte: u8, mut body: Bytes) -> anyhow::Result<ControlPacket> {
        let kind = PacketKind::try_from(first_byte >> 4)
            .map_err(|_| anyhow!("invalid packet type {}", first_byte >> 4))?;
        let flags = first_byte & 0x0f;

        let expected_flags = match kind {
            PacketKind::Publish => flags,
            PacketKind::Pubrel | PacketKind::Subscribe | PacketKind::Unsubscribe => FLAGS_RESERVED_0010,
            _ => 0,
        };
        if flags != expected_flags {
            bail!("invalid fixed header flags {:#06b} for {:?}", flags, kind);
        }

        let packet = match kind {
            PacketKind::Connect => ControlPacket::Connect(Self::deser_connect(&mut body)?),
            PacketKind::Connack => {
                let session_present = body.try_get_u8()? & 0x01 != 0;
                let raw_code = body.try_get_u8()?;
                let return_code = ConnectReturnCode::try_from(raw_code)
                    .map_err(|_| anyhow!("invalid CONNACK return code {}", raw_code))?;
                ControlPacket::Connack(ConnackPacket { session_present, return_code })
            }
            PacketKind::Publish => ControlPacket::Publish(Self::deser_publish(flags, body)?),
            PacketKind::Puback => ControlPacket::Puback { message_id: body.try_get_u16()? },
            PacketKind::Pubrec => ControlPacket::Pubrec { message_id: body.try_get_u16()? },
            PacketKind::Pubrel => ControlPacket::Pubrel { message_id: body.try_get_u16()? },
            PacketKind::Pubcomp => ControlPacket::Pubcomp { message_id: body.try_get_u16()? },
            PacketKind::Subscribe => {
                let message_id = body.try_get_u16()?;
                let mut topics = Vec::new();
                while body.has_remaining() {
                    let topic = body.try_get_mqtt_string()?;
                    topics.push((topic, Self::qos_from_bits(body.try_get_u8()?)?));
                }
                if topics.is_empty() {
                    bail!("SUBSCRIBE without topic filters");
                }
                ControlPacket::Subscribe(SubscribePacket { message_id, topics })
            }
            PacketKind::Suback => {
                let message_id = body.try_get_u16()?;
                ControlPacket::Suback(SubackPacket { message_id, return_codes: body.to_vec() })
            }
            PacketKind::Unsubscribe => {
                let message_id = body.try_get_u16()?;
                let mut topics = Vec::new();
                while body.has_remaining() {
                    topics.push(body.try_get_mqtt_string()?);
                }
                if topics.is_empty() {
                    bail!("UNSUBSCRIBE without topic filters");
                }
                ControlPacket::Unsubscribe(UnsubscribePacket { message_id, topics })
            }
            PacketKind::Unsuback => ControlPacket::Unsuback { message_id: body.try_get_u16()? },
            PacketKind::Pingreq => ControlPacket::Pingreq,
            PacketKind::Pingresp => ControlPacket::Pingresp,
            PacketKind::Disconnect => ControlPacket::Disconnect,
        };
        Ok(packet)
    }

    fn deser_connect(body: &mut Bytes) -> anyhow::Result<ConnectPacket> {
        let protocol_name = body.try_get_mqtt_string()?;
        let protocol_level = body.try_get_u8()?;
        if protocol_name != PROTOCOL_NAME || protocol_level != PROTOCOL_LEVEL_3_1_1 {
            bail!("unsupported protocol {:?} level {}", protocol_name, protocol_level);
        }

        let raw_flags = body.try_get_u8()?;
        let flags = ConnectFlags::from_bits(raw_flags)
            .ok_or_else(|| anyhow!("reserved CONNECT flag is set: {:#010b}", raw_flags))?;
        let keep_alive = body.try_get_u16()?;
        let client_id = body.try_get_mqtt_string()?;

        let will = if flags.contains(ConnectFlags::WILL) {
            let topic = body.try_get_mqtt_string()?;
            let message = body.try_get_mqtt_binary()?;
            Some(LastWill {
                topic,
                message,
                qos: Self::qos_from_bits(raw_flags >> 3)?,
                retain: flags.contains(ConnectFlags::WILL_RETAIN),
            })
        }
        else {
            None
        };

        let username = if flags.contains(ConnectFlags::USERNAME) {
            Some(body.try_get_mqtt_string()?)
        }
        else {
            None
        };
        let password = if flags.contains(ConnectFlags::PASSWORD) {
            Some(body.try_get_mqtt_binary()?)
        }
        else {
            None
        };

        Ok(ConnectPacket {
            client_id,
            clean_session: flags.contains(ConnectFlags::CLEAN_SESSION),
            keep_alive,
            will,
            username,
            password,
        })
    }

    fn deser_publish(flags: u8, mut body: Bytes) -> anyhow::Result<PublishPacket> {
        let qos = Self::qos_from_bits(flags >> 1)?;
        let topic = body.try_get_mqtt_string()?;
        let message_id = if qos == QoS::AtMostOnce {
            0
        }
        else {
            let id = body.try_get_u16()?;
            if id == 0 {
                bail!("QoS {:?} PUBLISH with message identifier 0", qos);
            }
            id
        };

        Ok(PublishPacket {
            dup: flags & 0b1000 != 0,
            qos,
            retain: flags & 0b0001 != 0,
            topic,
            message_id,
            payload: body,
        })
    }

    /// the two lowest bits of `bits` hold a QoS level
    fn qos_from_bits(bits: u8) -> anyhow::Result<QoS> {
        QoS::try_from(bits & 0b11)
            .map_err(|_| anyhow!("invalid QoS level {}", bits & 0b11))
    }
}
