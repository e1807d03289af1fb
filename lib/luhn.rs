/// Returns true when `number` is a non-empty ASCII digit string with a valid Luhn check digit.
pub fn is_valid(number: &str) -> bool {
    if number.is_empty() {
        return false;
    }

    let mut sum = 0u32;
    for (position, byte) in number.bytes().rev().enumerate() {
        if !byte.is_ascii_digit() {
            return false;
        }
        let mut digit = u32::from(byte - b'0');
        if position % 2 == 1 {
            digit *= 2;
            if digit > 9 {
                digit -= 9;
            }
        }
        sum += digit;
    }

    sum % 10 == 0
}
