//! Downstream message processing seam.
//!
//! Every inbound message is handed to a [`MessageProcessor`] exactly once.
//! The processor decides the outcome; the connector only frames the reply
//! and drives the unit of work.

use async_trait::async_trait;
use bytes::Bytes;
use mqb_broker::BrokerMessage;
use std::collections::BTreeMap;
use thiserror::Error;

/// A received message, split and ready for processing.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub connector_id: String,
    pub connector_name: String,
    pub content_type: String,
    pub header: Option<Bytes>,
    pub payload: Bytes,
    /// The message as received, descriptor included.
    pub message: BrokerMessage,
    pub reply_expected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    Success,
    Failed,
}

/// A response to send back.
#[derive(Debug, Clone, Default)]
pub struct ProcessedResponse {
    pub header: Option<Bytes>,
    pub payload: Bytes,
    /// Descriptor and property overrides for the reply message.
    pub overrides: BTreeMap<String, String>,
}

impl ProcessedResponse {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessingResult {
    pub status: ProcessingStatus,
    pub response: Option<ProcessedResponse>,
}

impl ProcessingResult {
    pub fn success(response: Option<ProcessedResponse>) -> Self {
        Self {
            status: ProcessingStatus::Success,
            response,
        }
    }

    pub fn failed(response: Option<ProcessedResponse>) -> Self {
        Self {
            status: ProcessingStatus::Failed,
            response,
        }
    }
}

/// Raised when processing could not produce an outcome at all.
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct ProcessingFault(pub String);

#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, request: InboundRequest) -> Result<ProcessingResult, ProcessingFault>;
}

/// Replies with the request payload.
#[derive(Debug, Default)]
pub struct EchoProcessor;

#[async_trait]
impl MessageProcessor for EchoProcessor {
    async fn process(&self, request: InboundRequest) -> Result<ProcessingResult, ProcessingFault> {
        Ok(ProcessingResult::success(Some(ProcessedResponse {
            header: request.header,
            payload: request.payload,
            overrides: BTreeMap::new(),
        })))
    }
}

/// A SOAP 1.1 fault document used as the reply when processing fails.
pub fn fault_payload(code: &str, reason: &str) -> Bytes {
    Bytes::from(format!(
        concat!(
            "<soapenv:Envelope xmlns:soapenv=\"http://schemas.xmlsoap.org/soap/envelope/\">",
            "<soapenv:Body><soapenv:Fault>",
            "<faultcode>soapenv:{}</faultcode>",
            "<faultstring>{}</faultstring>",
            "</soapenv:Fault></soapenv:Body></soapenv:Envelope>"
        ),
        escape_xml(code),
        escape_xml(reason)
    ))
}

fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_payload_escapes() {
        let fault = fault_payload("Client", "size > limit & rejected");
        let text = std::str::from_utf8(&fault).unwrap();
        assert!(text.contains("<faultcode>soapenv:Client</faultcode>"));
        assert!(text.contains("<faultstring>size &gt; limit &amp; rejected</faultstring>"));
    }
}
