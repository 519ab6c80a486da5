//! Builds and parses the `saslStart`/`saslContinue` commands that carry a SCRAM
//! conversation over the wire. The payload itself is always raw bytes on the wire protocol
//! level, but since the SCRAM messages this crate produces and consumes are always ASCII
//! key/value text, it's carried here as UTF-8 `String` for simplicity.

use bson::{doc, Binary, Bson, Document};

use crate::error::{Error, Result};

use super::scram::{ClientFirst, ScramMechanism};

pub fn build_sasl_start(mechanism: ScramMechanism, client_first: &ClientFirst) -> Document {
    doc! {
        "saslStart": 1,
        "mechanism": mechanism.name(),
        "payload": Binary { subtype: bson::spec::BinarySubtype::Generic, bytes: client_first.wire_payload().into_bytes() },
        "autoAuthorize": 1,
    }
}

pub fn build_sasl_continue(conversation_id: Bson, payload: &str) -> Document {
    doc! {
        "saslContinue": 1,
        "conversationId": conversation_id,
        "payload": Binary { subtype: bson::spec::BinarySubtype::Generic, bytes: payload.as_bytes().to_vec() },
    }
}

pub struct SaslReply {
    pub conversation_id: Bson,
    pub payload: String,
    pub done: bool,
}

pub fn parse_sasl_reply(reply: &Document) -> Result<SaslReply> {
    let ok = reply.get_f64("ok").unwrap_or(0.0);
    if ok != 1.0 {
        let code = reply.get_i32("code").unwrap_or(-1);
        let message = reply
            .get_str("errmsg")
            .unwrap_or("sasl step failed")
            .to_string();
        return Err(Error::authentication(format!(
            "sasl step rejected by server (code {code}): {message}"
        )));
    }

    let conversation_id = reply
        .get("conversationId")
        .cloned()
        .ok_or_else(|| Error::authentication("sasl reply missing conversationId"))?;
    let done = reply.get_bool("done").unwrap_or(false);
    let payload_bytes: Vec<u8> = match reply.get("payload") {
        Some(Bson::Binary(b)) => b.bytes.clone(),
        Some(Bson::String(s)) => s.as_bytes().to_vec(),
        _ => return Err(Error::authentication("sasl reply missing payload")),
    };
    let payload = String::from_utf8(payload_bytes)
        .map_err(|_| Error::authentication("sasl payload was not valid UTF-8"))?;

    Ok(SaslReply {
        conversation_id,
        payload,
        done,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_rejects_non_ok_replies() {
        let reply = doc! { "ok": 0.0, "code": 18, "errmsg": "auth failed" };
        assert!(parse_sasl_reply(&reply).is_err());
    }

    #[test]
    fn parse_extracts_payload_and_done_flag() {
        let reply = doc! {
            "ok": 1.0,
            "conversationId": 1,
            "done": false,
            "payload": Binary { subtype: bson::spec::BinarySubtype::Generic, bytes: b"r=abc,s=def,i=4096".to_vec() },
        };
        let parsed = parse_sasl_reply(&reply).unwrap();
        assert_eq!(parsed.payload, "r=abc,s=def,i=4096");
        assert!(!parsed.done);
    }
}
