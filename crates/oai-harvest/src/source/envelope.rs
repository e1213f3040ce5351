//! ListRecords envelope reader
//!
//! Pulls out only what the harvest loop needs: record headers, the raw
//! `<metadata>` payload, the resumption token and any `<error>` element.
//! Namespace prefixes are ignored; elements are matched by local name.

use super::{ProtocolError, Record};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

/// What one ListRecords response body contained
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Envelope {
    pub records: Vec<Record>,
    pub resumption_token: Option<String>,
    pub error: Option<ProtocolError>,
}

#[derive(Clone, Copy)]
enum Field {
    Identifier,
    Datestamp,
    SetSpec,
    ResumptionToken,
    Error,
}

fn attribute(e: &BytesStart<'_>, name: &str) -> Result<Option<String>, String> {
    match e.try_get_attribute(name).map_err(|err| err.to_string())? {
        Some(attr) => attr
            .unescape_value()
            .map(|v| Some(v.into_owned()))
            .map_err(|err| err.to_string()),
        None => Ok(None),
    }
}

fn open_error(e: &BytesStart<'_>) -> Result<ProtocolError, String> {
    Ok(ProtocolError {
        code: attribute(e, "code")?.unwrap_or_else(|| "unknown".to_string()),
        message: String::new(),
    })
}

/// Parse a ListRecords response body.
pub(crate) fn parse(body: &str) -> Result<Envelope, String> {
    let mut reader = Reader::from_str(body);
    reader.config_mut().trim_text(true);

    let mut envelope = Envelope::default();
    let mut record: Option<Record> = None;
    let mut in_header = false;
    let mut field: Option<Field> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| format!("at byte {}: {}", reader.buffer_position(), e))?;

        match event {
            Event::Start(e) => match e.local_name().as_ref() {
                b"record" => record = Some(Record::default()),
                b"header" if record.is_some() => {
                    in_header = true;
                    if attribute(&e, "status")?.as_deref() == Some("deleted") {
                        if let Some(ref mut r) = record {
                            r.deleted = true;
                        }
                    }
                }
                b"identifier" if in_header => field = Some(Field::Identifier),
                b"datestamp" if in_header => field = Some(Field::Datestamp),
                b"setSpec" if in_header => field = Some(Field::SetSpec),
                b"metadata" if record.is_some() => {
                    let end = e.to_end().into_owned();
                    let raw = reader.read_text(end.name()).map_err(|e| e.to_string())?;
                    if let Some(ref mut r) = record {
                        r.metadata = Some(raw.trim().to_string());
                    }
                }
                b"resumptionToken" => field = Some(Field::ResumptionToken),
                b"error" => {
                    envelope.error = Some(open_error(&e)?);
                    field = Some(Field::Error);
                }
                _ => {}
            },
            Event::Empty(e) => match e.local_name().as_ref() {
                b"header" if record.is_some() => {
                    if attribute(&e, "status")?.as_deref() == Some("deleted") {
                        if let Some(ref mut r) = record {
                            r.deleted = true;
                        }
                    }
                }
                b"error" => envelope.error = Some(open_error(&e)?),
                _ => {}
            },
            Event::Text(t) => {
                if let Some(f) = field {
                    let text = t.unescape().map_err(|e| e.to_string())?.trim().to_string();
                    assign(&mut envelope, record.as_mut(), f, text);
                }
            }
            Event::CData(t) => {
                if let Some(f) = field {
                    let text = String::from_utf8_lossy(&t.into_inner()).trim().to_string();
                    assign(&mut envelope, record.as_mut(), f, text);
                }
            }
            Event::End(e) => {
                field = None;
                match e.local_name().as_ref() {
                    b"header" => in_header = false,
                    b"record" => {
                        if let Some(r) = record.take() {
                            envelope.records.push(r);
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(envelope)
}

fn assign(envelope: &mut Envelope, record: Option<&mut Record>, field: Field, text: String) {
    match (field, record) {
        (Field::Identifier, Some(r)) => r.identifier = text,
        (Field::Datestamp, Some(r)) => r.datestamp = Some(text),
        (Field::SetSpec, Some(r)) => r.sets.push(text),
        (Field::ResumptionToken, _) => {
            envelope.resumption_token = Some(text).filter(|t| !t.is_empty());
        }
        (Field::Error, _) => {
            if let Some(ref mut err) = envelope.error {
                err.message = text;
            }
        }
        _ => {}
    }
}
