use colored::{ColoredString, Colorize};
use iced_x86::{Decoder, DecoderOptions, Formatter, FormatterOutput, FormatterTextKind, IntelFormatter};
use shaderinject_scanner::Pattern;

#[derive(Default)]
struct Output {
    pub buffer: String,
}

impl FormatterOutput for Output {
    fn write(&mut self, text: &str, kind: FormatterTextKind) {
        #[allow(clippy::unnecessary_to_owned)]
        self.buffer.push_str(&get_color(text, kind).to_string());
    }
}

/// Instructions covering the match of `pattern` at `address`, plus `trailing` more.
/// `data` starts at `address`. Matched bytes are bright, wildcard bytes dim.
pub(crate) fn disassemble_match(
    address: usize,
    data: &[u8],
    pattern: &Pattern,
    trailing: usize,
) -> String {
    let mut output = Output::default();
    output.buffer.push_str(&format!(
        "{:016x} - {:016x}\n",
        address,
        address + pattern.len()
    ));

    let mut formatter = IntelFormatter::new();
    formatter.options_mut().set_first_operand_char_index(8);

    let mut after = 0;
    for instruction in Decoder::with_ip(64, data, address as u64, DecoderOptions::NONE) {
        let index = instruction.ip() as usize - address;
        if index >= pattern.len() {
            if after == trailing {
                break;
            }
            after += 1;
        }

        output.buffer.push_str(&format!("{:016x}", instruction.ip()));
        output.buffer.push_str(":  ");

        for (i, b) in data[index..index + instruction.len()].iter().enumerate() {
            let s = format!("{b:02x}");
            let colored = match index + i {
                offset if offset >= pattern.len() => s.normal(),
                offset if pattern.is_wildcard(offset) => s.bright_black(),
                _ => s.bright_white(),
            };
            #[allow(clippy::unnecessary_to_owned)]
            output.buffer.push_str(&colored.to_string());
            output.buffer.push(' ');
        }

        for _ in 0..8usize.saturating_sub(instruction.len()) {
            output.buffer.push_str("   ");
        }

        formatter.format(&instruction, &mut output);
        output.buffer.push('\n');
    }
    output.buffer
}

fn get_color(s: &str, kind: FormatterTextKind) -> ColoredString {
    match kind {
        FormatterTextKind::Directive | FormatterTextKind::Keyword => s.bright_yellow(),
        FormatterTextKind::Prefix | FormatterTextKind::Mnemonic => s.bright_red(),
        FormatterTextKind::Register => s.bright_blue(),
        FormatterTextKind::Number => s.bright_cyan(),
        _ => s.white(),
    }
}
