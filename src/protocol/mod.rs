//! Protocol Module
//!
//! Defines the wire protocol for client-server communication.
//!
//! ## Protocol Format (V1 - Length-Prefixed Binary)
//!
//! ### Frame Format (requests and responses)
//! ```text
//! ┌──────────┬──────────┬─────────────────────────────┐
//! │ Type (1) │ Len (4)  │            Body             │
//! └──────────┴──────────┴─────────────────────────────┘
//! ```
//!
//! ### Request Types
//! - 0x01: HANDSHAKE - version (8)
//! - 0x02: OPEN      - name_len (4) + name
//! - 0x03: PREPARE   - db_id (4) + sql_len (4) + sql
//! - 0x04: EXEC      - stmt_id (4) + param_count (2) + tagged params
//! - 0x05: QUERY     - stmt_id (4) + consistency (1) + param_count (2) + params
//! - 0x06: FINALIZE  - stmt_id (4)
//!
//! ### Response Types
//! - 0x01: ACK
//! - 0x02: DB          - db_id (4)
//! - 0x03: STMT        - stmt_id (4) + mutates (1) + param_count (2)
//! - 0x04: EXEC_RESULT - last_insert_id (8) + rows_affected (8)
//! - 0x05: ROWS_HEADER - col_count (2) + [name_len (4) + name]
//! - 0x06: ROW_BATCH   - row_count (2) + col_count (2) + tagged values
//! - 0x07: ROWS_DONE
//! - 0xFF: ERROR       - code (2) + msg_len (4) + msg + detail_len (4) + detail
//!
//! A result set is streamed as one ROWS_HEADER, any number of ROW_BATCH
//! frames bounded by the configured frame size, and a terminating ROWS_DONE.

mod request;
mod response;
mod codec;

pub use request::{Consistency, Request, RequestType};
pub use response::{Response, ResponseType};
pub use codec::{
    decode_request, decode_response, encode_request, encode_response, read_request,
    read_response, write_request, write_response, HEADER_SIZE, MAX_FRAME_SIZE,
};
