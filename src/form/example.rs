/// Passage loaded by the "Use Example Text" button.
pub const EXAMPLE_TEXT: &str = "\
I have been switching between search engines for the better part of a year now, and the \
differences are bigger than I expected. The big incumbent still wins on sheer coverage: \
obscure error messages, local opening hours and half-forgotten song lyrics almost always turn \
up on the first page. But the results page has become cluttered. Sponsored links sit above the \
organic results, shopping carousels push everything else down, and on a laptop screen I often \
have to scroll before I see a single link I actually chose to look for.

The privacy-focused alternatives feel calmer. Pages load quickly, there is no wall of ads, and I \
like knowing my queries are not being stitched into a profile. Their weakness is depth. For \
everyday questions they are just as good, but for technical searches or anything very recent I \
regularly fall back to the big engine with a shortcut. Some newer engines try to answer the \
question directly with a generated summary at the top. When it works it saves a click; when it \
is wrong it is confidently wrong, and I have caught it inventing details more than once.

My conclusion after a year: no single engine is best at everything. I now use a privacy-focused \
engine as the default, keep a keyword shortcut for the big one, and treat any generated answer \
as a starting point rather than the final word. Competition has clearly made all of them better, \
and I hope it stays that way.";
