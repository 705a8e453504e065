pub mod compressed_reader;
pub mod compressed_writer;
pub mod frame;
pub mod reader;
pub mod stream;
pub mod task_event;
pub mod writer;
