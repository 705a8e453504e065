use crate::commands::exit_result::ExitResult;
use crate::commands::options::DumpOptions;
use crate::trace::reader::TraceReader;
use std::io::stdout;

pub fn dump(options: &DumpOptions) -> ExitResult {
    let mut reader = TraceReader::new(options.trace_dir.as_deref());
    let out = &mut stdout();
    while let Some(frame) = reader.read_frame() {
        if frame.time() < options.from_event {
            continue;
        }
        if options.to_event != 0 && frame.time() > options.to_event {
            break;
        }
        let result = if options.raw {
            frame.dump_raw(out)
        } else {
            frame.dump(out)
        };
        if result.is_err() {
            // stdout closed under us (e.g. piped to head).
            break;
        }
    }
    ExitResult::Ok
}
