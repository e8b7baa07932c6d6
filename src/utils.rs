/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

/// Map a callsign to its telephone-keypad digit string. Letters map to the
/// digit carrying them on a phone keypad, digits map to themselves, all other
/// characters are skipped.
pub fn callsign_code(callsign: &str) -> String {
    let mut code = String::new();
    for c in callsign.chars() {
        let digit = match c.to_ascii_uppercase() {
            'A'..='C' => '2',
            'D'..='F' => '3',
            'G'..='I' => '4',
            'J'..='L' => '5',
            'M'..='O' => '6',
            'P'..='S' => '7',
            'T'..='V' => '8',
            'W'..='Z' => '9',
            d @ '0'..='9' => d,
            _ => continue,
        };
        code.push(digit);
    }
    code
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn callsign_code_maps_keypad_digits() {
        assert_eq!("760789", callsign_code("SM0SVX"));
        assert_eq!("760789", callsign_code("sm0svx"));
        assert_eq!("35025", callsign_code("DK0A-L"));
    }
}
